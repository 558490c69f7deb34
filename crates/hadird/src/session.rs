//! Detection tick loop.
//!
//! One attendance session runs ticks at a fixed period until a commit
//! succeeds, the pipeline halts, or the session is cancelled. Each tick
//! awaits the detector and feeds the coordinator inside the loop body, so a
//! tick never overlaps the next one; timer fires that land while a tick is
//! still running are skipped. Commits run as separate tasks and report back
//! over a channel that is only drained between ticks.
//!
//! Sessions after the first start disarmed: the face that was just recorded
//! has to leave the frame before anything is counted again.

use std::time::Duration;

use hadir_core::detector::subject;
use hadir_core::{
    AttendanceCoordinator, AttendanceRecord, AttendanceStore, CoordinatorConfig, DetectError,
    Detector, FeedbackSink, Step,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::detector::spawn_detector;
use crate::status::StatusSink;
use crate::store::AttendanceDb;

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub coordinator: CoordinatorConfig,
    pub tick_interval: Duration,
    /// Cadence of the post-commit countdown.
    pub countdown_step: Duration,
    /// Consecutive transient detector failures tolerated before halting.
    pub max_detector_failures: u32,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            coordinator: config.coordinator(),
            tick_interval: config.tick_interval(),
            countdown_step: Duration::from_secs(1),
            max_detector_failures: config.max_detector_failures,
        }
    }
}

/// How a session treats a face that is already in view when it starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arming {
    /// Faces count from the first tick.
    Immediate,
    /// Faces are ignored until one tick sees nobody.
    AfterAbsence,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("attendance pipeline halted: {0}")]
    Halted(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    Committed(AttendanceRecord),
    Cancelled,
}

type CommitResult = Result<AttendanceRecord, String>;

/// Run one attendance session to completion.
pub async fn run_session<D, S, F>(
    detector: &mut D,
    store: &S,
    sink: F,
    settings: &SessionSettings,
    arming: Arming,
    cancel: &CancellationToken,
) -> Result<SessionOutcome, SessionError>
where
    D: Detector,
    S: AttendanceStore,
    F: FeedbackSink,
{
    let mut coordinator = AttendanceCoordinator::new(settings.coordinator, sink);
    let (commit_tx, mut commit_rx) = mpsc::channel::<CommitResult>(1);

    let mut ticker = tokio::time::interval(settings.tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut detector_failures = 0u32;
    let mut armed = arming == Arming::Immediate;

    if armed {
        tracing::info!("attendance session started");
    } else {
        tracing::info!("attendance session started; waiting for previous subject to leave");
    }

    let record = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!("attendance session cancelled");
                return Ok(SessionOutcome::Cancelled);
            }
            Some(result) = commit_rx.recv() => {
                coordinator.on_commit_result(result);
                if let Some(record) = coordinator.session().record() {
                    break record.clone();
                }
            }
            _ = ticker.tick() => {
                let faces = match detector.detect_faces().await {
                    Ok(faces) => {
                        detector_failures = 0;
                        faces
                    }
                    Err(DetectError::Transient(message)) => {
                        detector_failures += 1;
                        tracing::debug!(
                            error = %message,
                            consecutive = detector_failures,
                            "tick skipped: no usable detection"
                        );
                        if detector_failures >= settings.max_detector_failures {
                            let message = format!(
                                "detector unavailable after {detector_failures} consecutive failures (last: {message})"
                            );
                            coordinator.halt(&message);
                            return Err(SessionError::Halted(message));
                        }
                        continue;
                    }
                    Err(DetectError::Fatal(message)) => {
                        coordinator.halt(&message);
                        return Err(SessionError::Halted(message));
                    }
                };

                let face = subject(&faces);
                if !armed {
                    if face.is_some() {
                        continue;
                    }
                    armed = true;
                    tracing::debug!("frame clear, session armed");
                }

                let mut step = coordinator.on_tick(face);
                if step == Step::LoadIdentities {
                    step = match store.fetch_enrolled_identities().await {
                        Ok(identities) => coordinator.on_identities_loaded(identities),
                        Err(e) => {
                            coordinator.on_identities_failed(&e.to_string());
                            Step::Continue
                        }
                    };
                }
                if let Step::Commit(identity) = step {
                    spawn_commit(store.clone(), identity, commit_tx.clone());
                }
            }
        }
    };

    // Countdown, then the sink is told to move on
    while coordinator.countdown_remaining() > 0 {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(settings.countdown_step) => {
                coordinator.advance_countdown();
            }
        }
    }

    Ok(SessionOutcome::Committed(record))
}

fn spawn_commit<S: AttendanceStore>(
    store: S,
    identity: hadir_core::EnrolledIdentity,
    tx: mpsc::Sender<CommitResult>,
) {
    tokio::spawn(async move {
        tracing::debug!(label = %identity.label, "commit started");
        let result = store.commit(&identity).await.map_err(|e| e.to_string());
        // Receiver is gone if the session was torn down meanwhile
        if tx.send(result).await.is_err() {
            tracing::debug!(label = %identity.label, "commit resolved after session ended");
        }
    });
}

/// Run attendance sessions on the configured detection source until
/// cancelled or halted.
///
/// A missing detection source is a setup failure: the status shows the
/// error and no session starts. Recovery needs a daemon restart.
pub async fn run_kiosk(
    config: Config,
    store: AttendanceDb,
    sink: StatusSink,
    cancel: CancellationToken,
) {
    let settings = SessionSettings::from_config(&config);

    let mut detector = match spawn_detector(&config.detector_source, config.frame_timeout()) {
        Ok(detector) => detector,
        Err(e) => {
            let mut coordinator = AttendanceCoordinator::new(settings.coordinator, sink);
            coordinator.halt(&e.to_string());
            return;
        }
    };

    run_sessions(&mut detector, &store, sink, &settings, &cancel).await;
}

/// Back-to-back sessions. Only the first one arms immediately.
async fn run_sessions<D, S, F>(
    detector: &mut D,
    store: &S,
    sink: F,
    settings: &SessionSettings,
    cancel: &CancellationToken,
) where
    D: Detector,
    S: AttendanceStore,
    F: FeedbackSink + Clone,
{
    let mut arming = Arming::Immediate;
    loop {
        match run_session(detector, store, sink.clone(), settings, arming, cancel).await {
            Ok(SessionOutcome::Committed(record)) => {
                tracing::info!(label = %record.label, "starting next attendance session");
                arming = Arming::AfterAbsence;
            }
            Ok(SessionOutcome::Cancelled) => break,
            Err(e) => {
                tracing::error!(error = %e, "attendance loop stopped; restart hadird to recover");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hadir_core::{
        CoordinatorState, Descriptor, EnrolledIdentity, FaceDetection, FeedbackEvent, Rect,
        DESCRIPTOR_DIM,
    };
    use std::collections::VecDeque;
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex};

    // ── Fakes ────────────────────────────────────────────────────────────────

    fn desc(head: f32) -> Descriptor {
        let mut values = vec![0.0; DESCRIPTOR_DIM];
        values[0] = head;
        Descriptor::new(values).unwrap()
    }

    /// Face swaying 10 px between ticks.
    fn moving_face(tick: u32) -> FaceDetection {
        let x = if tick % 2 == 0 { 100.0 } else { 110.0 };
        FaceDetection {
            bbox: Rect {
                x,
                y: 50.0,
                width: 80.0,
                height: 80.0,
            },
            descriptor: desc(0.0),
        }
    }

    /// Detector replaying a script, then a face swaying 10 px forever.
    struct ScriptedDetector {
        script: VecDeque<Result<Vec<FaceDetection>, DetectError>>,
        calls: u32,
    }

    impl ScriptedDetector {
        fn moving() -> Self {
            Self::with_script(vec![])
        }

        fn with_script(script: Vec<Result<Vec<FaceDetection>, DetectError>>) -> Self {
            Self {
                script: script.into(),
                calls: 0,
            }
        }
    }

    impl Detector for ScriptedDetector {
        async fn detect_faces(&mut self) -> Result<Vec<FaceDetection>, DetectError> {
            self.calls += 1;
            if let Some(next) = self.script.pop_front() {
                return next;
            }
            Ok(vec![moving_face(self.calls)])
        }
    }

    #[derive(Debug, thiserror::Error)]
    #[error("{0}")]
    struct FakeError(String);

    #[derive(Default)]
    struct FakeStoreInner {
        identities: Vec<EnrolledIdentity>,
        /// Outcomes for successive commits; success once exhausted.
        commit_failures: VecDeque<String>,
        fetch_calls: u32,
        commit_calls: u32,
    }

    #[derive(Clone, Default)]
    struct FakeStore {
        inner: Arc<Mutex<FakeStoreInner>>,
        commit_delay: Duration,
    }

    impl FakeStore {
        fn with_alice() -> Self {
            let store = Self::default();
            store.inner.lock().unwrap().identities.push(EnrolledIdentity {
                label: "2401001".into(),
                name: "Alice".into(),
                descriptor: desc(0.0),
            });
            store
        }

        fn fetch_calls(&self) -> u32 {
            self.inner.lock().unwrap().fetch_calls
        }

        fn commit_calls(&self) -> u32 {
            self.inner.lock().unwrap().commit_calls
        }
    }

    impl AttendanceStore for FakeStore {
        type Error = FakeError;

        async fn fetch_enrolled_identities(&self) -> Result<Vec<EnrolledIdentity>, FakeError> {
            let mut inner = self.inner.lock().unwrap();
            inner.fetch_calls += 1;
            Ok(inner.identities.clone())
        }

        async fn commit(&self, identity: &EnrolledIdentity) -> Result<AttendanceRecord, FakeError> {
            let failure = {
                let mut inner = self.inner.lock().unwrap();
                inner.commit_calls += 1;
                inner.commit_failures.pop_front()
            };
            tokio::time::sleep(self.commit_delay).await;
            if let Some(message) = failure {
                return Err(FakeError(message));
            }
            Ok(AttendanceRecord {
                id: "rec".into(),
                label: identity.label.clone(),
                name: identity.name.clone(),
                weekday: "Wednesday".into(),
                date: "2026-10-14".into(),
                time: "09:00:00".into(),
                status: "present".into(),
                created_at: "2026-10-14T02:00:00Z".into(),
            })
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Vec<FeedbackEvent>,
        last_state: CoordinatorState,
        navigated: u32,
    }

    impl FeedbackSink for Recorder {
        fn emit(&mut self, event: FeedbackEvent) {
            self.events.push(event);
        }

        fn state_changed(&mut self, state: CoordinatorState) {
            self.last_state = state;
        }

        fn navigate_away(&mut self, _record: &AttendanceRecord) {
            self.navigated += 1;
        }
    }

    fn settings() -> SessionSettings {
        SessionSettings {
            coordinator: CoordinatorConfig::default(),
            tick_interval: Duration::from_millis(1),
            countdown_step: Duration::from_millis(1),
            max_detector_failures: 5,
        }
    }

    // ── Tests ────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_slow_commit_is_issued_once() {
        let mut detector = ScriptedDetector::moving();
        let store = FakeStore {
            commit_delay: Duration::from_millis(50),
            ..FakeStore::with_alice()
        };
        let mut sink = Recorder::default();

        let outcome = run_session(
            &mut detector,
            &store,
            &mut sink,
            &settings(),
            Arming::Immediate,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        match outcome {
            SessionOutcome::Committed(record) => assert_eq!(record.label, "2401001"),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(store.commit_calls(), 1);
        assert_eq!(store.fetch_calls(), 1);
        assert_eq!(sink.last_state, CoordinatorState::Committed);
        assert_eq!(sink.navigated, 1);

        let countdowns: Vec<u32> = sink
            .events
            .iter()
            .filter_map(|e| match e {
                FeedbackEvent::Committed { countdown, .. } => Some(*countdown),
                _ => None,
            })
            .collect();
        assert_eq!(countdowns, vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn test_failed_commit_is_retried_once() {
        let mut detector = ScriptedDetector::moving();
        let store = FakeStore::with_alice();
        store
            .inner
            .lock()
            .unwrap()
            .commit_failures
            .push_back("connection reset".into());
        let mut sink = Recorder::default();

        let outcome = run_session(
            &mut detector,
            &store,
            &mut sink,
            &settings(),
            Arming::Immediate,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(matches!(outcome, SessionOutcome::Committed(_)));
        assert_eq!(store.commit_calls(), 2);
        assert_eq!(store.fetch_calls(), 1);
        assert!(sink.events.iter().any(|e| matches!(
            e,
            FeedbackEvent::Error { message } if message.contains("connection reset")
        )));
    }

    #[tokio::test]
    async fn test_fatal_detector_error_halts() {
        let mut detector = ScriptedDetector::with_script(vec![
            Ok(vec![]),
            Err(DetectError::Fatal("model missing".into())),
        ]);
        let store = FakeStore::with_alice();
        let mut sink = Recorder::default();

        let err = run_session(
            &mut detector,
            &store,
            &mut sink,
            &settings(),
            Arming::Immediate,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert_eq!(err, SessionError::Halted("model missing".into()));
        assert_eq!(sink.last_state, CoordinatorState::Halted);
        assert!(matches!(sink.events.last(), Some(FeedbackEvent::Error { .. })));
        assert_eq!(store.commit_calls(), 0);
    }

    #[tokio::test]
    async fn test_repeated_transient_failures_escalate() {
        let script = (0..10)
            .map(|_| Err(DetectError::Transient("no frame".into())))
            .collect();
        let mut detector = ScriptedDetector::with_script(script);
        let store = FakeStore::with_alice();
        let mut sink = Recorder::default();

        let err = run_session(
            &mut detector,
            &store,
            &mut sink,
            &settings(),
            Arming::Immediate,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, SessionError::Halted(ref m) if m.contains("5 consecutive")));
        assert_eq!(detector.calls, 5);
    }

    #[tokio::test]
    async fn test_occasional_transient_failures_are_tolerated() {
        let mut script = Vec::new();
        for _ in 0..6 {
            script.push(Err(DetectError::Transient("dropped frame".into())));
            script.push(Err(DetectError::Transient("dropped frame".into())));
            script.push(Ok(vec![]));
        }
        let mut detector = ScriptedDetector::with_script(script);
        let store = FakeStore::with_alice();
        let mut sink = Recorder::default();

        let outcome = run_session(
            &mut detector,
            &store,
            &mut sink,
            &settings(),
            Arming::Immediate,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(matches!(outcome, SessionOutcome::Committed(_)));
        assert_eq!(store.commit_calls(), 1);
        // Transient failures are not "no face": no extra waiting events
        let waiting = sink
            .events
            .iter()
            .filter(|e| matches!(e, FeedbackEvent::Waiting))
            .count();
        assert_eq!(waiting, 1);
    }

    #[tokio::test]
    async fn test_cancelled_session_does_not_tick() {
        let mut detector = ScriptedDetector::moving();
        let store = FakeStore::with_alice();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut events: Vec<FeedbackEvent> = Vec::new();

        let outcome = run_session(
            &mut detector,
            &store,
            &mut events,
            &settings(),
            Arming::Immediate,
            &cancel,
        )
        .await
        .unwrap();

        assert_eq!(outcome, SessionOutcome::Cancelled);
        assert_eq!(detector.calls, 0);
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_face_runs_until_cancelled() {
        let mut detector = ScriptedDetector::moving();
        // Nobody enrolled
        let store = FakeStore::default();
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });
        let mut sink = Recorder::default();

        let outcome = run_session(
            &mut detector,
            &store,
            &mut sink,
            &settings(),
            Arming::Immediate,
            &cancel,
        )
        .await
        .unwrap();

        assert_eq!(outcome, SessionOutcome::Cancelled);
        assert_eq!(store.commit_calls(), 0);
        assert_eq!(store.fetch_calls(), 1);
        assert_eq!(sink.last_state, CoordinatorState::Verified);
        let unrecognized = sink
            .events
            .iter()
            .filter(|e| matches!(e, FeedbackEvent::Unrecognized { .. }))
            .count();
        assert_eq!(unrecognized, 1);
    }

    #[tokio::test]
    async fn test_disarmed_session_ignores_lingering_face() {
        let mut detector = ScriptedDetector::moving();
        let store = FakeStore::with_alice();
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });
        let mut events: Vec<FeedbackEvent> = Vec::new();

        let outcome = run_session(
            &mut detector,
            &store,
            &mut events,
            &settings(),
            Arming::AfterAbsence,
            &cancel,
        )
        .await
        .unwrap();

        assert_eq!(outcome, SessionOutcome::Cancelled);
        assert!(detector.calls > 15);
        assert!(events.is_empty());
        assert_eq!(store.fetch_calls(), 0);
        assert_eq!(store.commit_calls(), 0);
    }

    // ── Kiosk loop ───────────────────────────────────────────────────────────

    fn kiosk_config(source: PathBuf) -> Config {
        Config {
            db_path: PathBuf::from(":memory:"),
            detector_source: source,
            movement_threshold: 5.0,
            frame_threshold: 15,
            window_capacity: 30,
            match_threshold: 0.6,
            tick_interval_ms: 1,
            liveness_enabled: true,
            countdown_secs: 3,
            frame_timeout_ms: 2000,
            max_detector_failures: 5,
            session_bus: true,
        }
    }

    #[tokio::test]
    async fn test_kiosk_missing_source_halts_without_session() {
        let config = kiosk_config(PathBuf::from("/nonexistent/hadir/detections"));
        let store = AttendanceDb::open(Path::new(":memory:")).await.unwrap();
        let sink = StatusSink::new();
        let status = sink.subscribe();

        run_kiosk(config, store.clone(), sink, CancellationToken::new()).await;

        let snapshot = status.borrow().clone();
        assert_eq!(snapshot.state, CoordinatorState::Halted);
        assert!(matches!(
            snapshot.last_event,
            Some(FeedbackEvent::Error { ref message }) if message.contains("detection source unavailable")
        ));
        assert_eq!(snapshot.sessions_completed, 0);
        assert_eq!(store.stats().await.unwrap().total_attendance, 0);
    }

    #[tokio::test]
    async fn test_kiosk_halts_when_source_ends() {
        let dir = std::env::temp_dir().join(format!(
            "hadir-kiosk-test-{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let source = dir.join("detections");
        std::fs::write(&source, "{\"faces\":[]}\n{\"faces\":[]}\n").unwrap();

        let store = AttendanceDb::open(Path::new(":memory:")).await.unwrap();
        let sink = StatusSink::new();
        let status = sink.subscribe();

        tokio::time::timeout(
            Duration::from_secs(10),
            run_kiosk(kiosk_config(source), store, sink, CancellationToken::new()),
        )
        .await
        .unwrap();

        let snapshot = status.borrow().clone();
        assert_eq!(snapshot.state, CoordinatorState::Halted);
        assert_eq!(
            snapshot.last_event,
            Some(FeedbackEvent::Error {
                message: "detection source closed".into()
            })
        );
        assert_eq!(snapshot.sessions_completed, 0);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_lingering_face_is_recorded_once() {
        let mut detector = ScriptedDetector::moving();
        let store = FakeStore::with_alice();
        let sink = StatusSink::new();
        let status = sink.subscribe();
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            canceller.cancel();
        });

        run_sessions(&mut detector, &store, sink, &settings(), &cancel).await;

        assert_eq!(store.commit_calls(), 1);
        assert_eq!(status.borrow().sessions_completed, 1);
    }

    #[tokio::test]
    async fn test_next_session_arms_after_face_leaves() {
        // Face stays well past the first commit, leaves briefly, then returns
        let mut script: Vec<Result<Vec<FaceDetection>, DetectError>> =
            (0..40).map(|i| Ok(vec![moving_face(i)])).collect();
        script.extend((0..3).map(|_| Ok(vec![])));
        let mut detector = ScriptedDetector::with_script(script);
        let store = FakeStore::with_alice();
        let sink = StatusSink::new();
        let mut status = sink.subscribe();
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            let _ = status.wait_for(|s| s.sessions_completed >= 2).await;
            canceller.cancel();
        });

        tokio::time::timeout(
            Duration::from_secs(10),
            run_sessions(&mut detector, &store, sink.clone(), &settings(), &cancel),
        )
        .await
        .unwrap();

        assert_eq!(store.commit_calls(), 2);
        assert_eq!(store.fetch_calls(), 2);
        assert_eq!(sink.subscribe().borrow().sessions_completed, 2);
    }
}
