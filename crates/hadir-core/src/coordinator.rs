//! Attendance state machine.
//!
//! [`AttendanceCoordinator`] consumes one detection result per tick, drives
//! the liveness tracker and the identity matcher, and decides when the single
//! attendance commit of a session starts. It performs no I/O: the caller runs
//! the detector, loads identities and performs the commit, reporting back
//! through `on_*` methods. All calls must come from one logical thread of
//! control, one tick at a time.
//!
//! ```text
//! Idle -> Observing -> Verifying -> Verified -> Submitting -> Committed
//!                                      ^            |
//!                                      +-- Failed <-+
//! any -> Halted (fatal)
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::feedback::{FeedbackEvent, FeedbackSink};
use crate::liveness::{LivenessConfig, LivenessStatus, MotionLivenessTracker};
use crate::matcher::{IdentityMatcher, DEFAULT_MATCH_THRESHOLD};
use crate::types::{AttendanceRecord, Descriptor, EnrolledIdentity, FaceDetection};

/// Default number of one-second countdown steps after a successful commit.
pub const DEFAULT_COUNTDOWN_SECS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorState {
    /// No tick processed yet.
    #[default]
    Idle,
    /// Ticking, no face in frame.
    Observing,
    /// Face in frame, liveness evidence accumulating.
    Verifying,
    /// Live face; matching against the enrolled set.
    Verified,
    /// Commit in flight.
    Submitting,
    /// Attendance recorded. Terminal for the session.
    Committed,
    /// Last commit failed; the next matched tick retries.
    Failed,
    /// Fatal failure. Terminal until the pipeline is re-initialized.
    Halted,
}

impl CoordinatorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoordinatorState::Idle => "idle",
            CoordinatorState::Observing => "observing",
            CoordinatorState::Verifying => "verifying",
            CoordinatorState::Verified => "verified",
            CoordinatorState::Submitting => "submitting",
            CoordinatorState::Committed => "committed",
            CoordinatorState::Failed => "failed",
            CoordinatorState::Halted => "halted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CoordinatorState::Committed | CoordinatorState::Halted)
    }
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    pub liveness: LivenessConfig,
    /// Maximum descriptor distance for a positive match.
    pub match_threshold: f32,
    /// When false every face is treated as live (demo override).
    pub liveness_enabled: bool,
    /// Countdown steps emitted after a successful commit.
    pub countdown_secs: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            liveness: LivenessConfig::default(),
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            liveness_enabled: true,
            countdown_secs: DEFAULT_COUNTDOWN_SECS,
        }
    }
}

/// One attendance session. At most one successful commit per session.
#[derive(Debug, Clone, Default)]
pub struct AttendanceSession {
    committed: bool,
    record: Option<AttendanceRecord>,
}

impl AttendanceSession {
    pub fn is_committed(&self) -> bool {
        self.committed
    }

    pub fn record(&self) -> Option<&AttendanceRecord> {
        self.record.as_ref()
    }
}

/// What the driver must do after feeding the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Continue,
    /// Fetch the enrolled identities and pass them to
    /// [`AttendanceCoordinator::on_identities_loaded`] within this tick.
    LoadIdentities,
    /// Start the commit for this identity and report the outcome through
    /// [`AttendanceCoordinator::on_commit_result`].
    Commit(EnrolledIdentity),
}

pub struct AttendanceCoordinator<F: FeedbackSink> {
    config: CoordinatorConfig,
    tracker: MotionLivenessTracker,
    /// `None` until the enrolled set is loaded (lazily, on first need).
    matcher: Option<IdentityMatcher>,
    state: CoordinatorState,
    session: AttendanceSession,
    /// Submission latch: set while a commit is unresolved.
    in_flight: bool,
    /// Verification announced for the current face presence.
    announced: bool,
    /// Descriptor held between `LoadIdentities` and `on_identities_loaded`.
    pending: Option<Descriptor>,
    countdown: u32,
    last_event: Option<FeedbackEvent>,
    sink: F,
}

impl<F: FeedbackSink> AttendanceCoordinator<F> {
    pub fn new(config: CoordinatorConfig, sink: F) -> Self {
        Self {
            tracker: MotionLivenessTracker::new(config.liveness),
            config,
            matcher: None,
            state: CoordinatorState::Idle,
            session: AttendanceSession::default(),
            in_flight: false,
            announced: false,
            pending: None,
            countdown: 0,
            last_event: None,
            sink,
        }
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    pub fn session(&self) -> &AttendanceSession {
        &self.session
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn liveness(&self) -> LivenessStatus {
        self.tracker.status()
    }

    pub fn identities_loaded(&self) -> bool {
        self.matcher.is_some()
    }

    pub fn commit_in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn countdown_remaining(&self) -> u32 {
        self.countdown
    }

    pub fn sink(&self) -> &F {
        &self.sink
    }

    pub fn into_sink(self) -> F {
        self.sink
    }

    /// Process one tick. `face` is the subject of this frame, or `None` when
    /// the detector saw no face.
    pub fn on_tick(&mut self, face: Option<&FaceDetection>) -> Step {
        if self.state.is_terminal() {
            return Step::Continue;
        }

        let Some(face) = face else {
            self.tracker.reset();
            self.announced = false;
            if !self.in_flight {
                self.set_state(CoordinatorState::Observing);
                self.emit(FeedbackEvent::Waiting);
            }
            return Step::Continue;
        };

        if self.in_flight {
            // Keep the evidence current; the latch blocks everything else
            if self.config.liveness_enabled {
                self.tracker.update(face.bbox.center());
            }
            return Step::Continue;
        }

        if self.config.liveness_enabled {
            let newly_verified = self.tracker.update(face.bbox.center());
            if !self.tracker.is_verified() {
                let status = self.tracker.status();
                self.set_state(CoordinatorState::Verifying);
                self.emit(FeedbackEvent::Verifying {
                    frame_count: status.frame_count,
                    frame_threshold: self.config.liveness.frame_threshold,
                    progress: status.progress,
                });
                return Step::Continue;
            }
            if newly_verified {
                tracing::info!(frames = self.tracker.status().frame_count, "liveness verified");
            }
        }

        self.set_state(CoordinatorState::Verified);
        if !self.announced {
            self.announced = true;
            self.emit(FeedbackEvent::Verified);
        }

        self.match_face(&face.descriptor)
    }

    /// Complete a tick that returned [`Step::LoadIdentities`].
    pub fn on_identities_loaded(&mut self, identities: Vec<EnrolledIdentity>) -> Step {
        let mut matcher = IdentityMatcher::new(self.config.match_threshold);
        matcher.load(identities);
        tracing::info!(count = matcher.len(), "enrolled identities loaded");
        self.matcher = Some(matcher);

        match self.pending.take() {
            Some(descriptor) if self.state == CoordinatorState::Verified && !self.in_flight => {
                self.match_face(&descriptor)
            }
            _ => Step::Continue,
        }
    }

    /// The enrolled set could not be fetched; a later tick asks again.
    pub fn on_identities_failed(&mut self, message: &str) {
        self.pending = None;
        if self.state.is_terminal() {
            return;
        }
        tracing::warn!(error = message, "failed to load enrolled identities");
        self.emit(FeedbackEvent::Error {
            message: format!("could not load enrolled identities: {message}"),
        });
    }

    /// Report the outcome of the commit started by [`Step::Commit`].
    pub fn on_commit_result(&mut self, result: Result<AttendanceRecord, String>) {
        if !self.in_flight || self.state == CoordinatorState::Halted {
            tracing::debug!("ignoring commit result with no commit in flight");
            return;
        }
        self.in_flight = false;

        match result {
            Ok(record) => {
                tracing::info!(
                    label = %record.label,
                    id = %record.id,
                    "attendance committed"
                );
                self.countdown = self.config.countdown_secs;
                self.set_state(CoordinatorState::Committed);
                self.session.committed = true;
                if self.countdown > 0 {
                    self.emit(FeedbackEvent::Committed {
                        label: record.label.clone(),
                        name: record.name.clone(),
                        countdown: self.countdown,
                    });
                    self.session.record = Some(record);
                } else {
                    self.sink.navigate_away(&record);
                    self.session.record = Some(record);
                }
            }
            Err(message) => {
                tracing::warn!(error = %message, "attendance commit failed");
                self.set_state(CoordinatorState::Failed);
                self.emit(FeedbackEvent::Error {
                    message: format!("attendance not recorded: {message}"),
                });
            }
        }
    }

    /// Advance the post-commit countdown by one step.
    ///
    /// Returns `true` while steps remain. The final step signals
    /// navigation-away to the sink.
    pub fn advance_countdown(&mut self) -> bool {
        if self.state != CoordinatorState::Committed || self.countdown == 0 {
            return false;
        }
        self.countdown -= 1;

        let Some(record) = self.session.record.clone() else {
            return false;
        };
        if self.countdown > 0 {
            self.emit(FeedbackEvent::Committed {
                label: record.label,
                name: record.name,
                countdown: self.countdown,
            });
            true
        } else {
            self.sink.navigate_away(&record);
            false
        }
    }

    /// Enter the terminal error state.
    pub fn halt(&mut self, message: &str) {
        if self.state == CoordinatorState::Halted {
            return;
        }
        tracing::error!(error = message, "attendance pipeline halted");
        self.in_flight = false;
        self.pending = None;
        self.set_state(CoordinatorState::Halted);
        self.emit(FeedbackEvent::Error {
            message: message.to_string(),
        });
    }

    fn match_face(&mut self, descriptor: &Descriptor) -> Step {
        let Some(matcher) = &self.matcher else {
            self.pending = Some(descriptor.clone());
            return Step::LoadIdentities;
        };

        let result = matcher.recognize(descriptor);
        let identity = result
            .label
            .as_deref()
            .and_then(|label| matcher.identity(label))
            .cloned();

        match identity {
            None => {
                tracing::debug!(result = %result, "face not recognized");
                self.emit(FeedbackEvent::Unrecognized {
                    distance: result.distance,
                });
                Step::Continue
            }
            Some(identity) => {
                tracing::info!(result = %result, "face recognized, committing attendance");
                self.in_flight = true;
                self.set_state(CoordinatorState::Submitting);
                self.emit(FeedbackEvent::Submitting {
                    label: identity.label.clone(),
                    name: identity.name.clone(),
                });
                Step::Commit(identity)
            }
        }
    }

    fn set_state(&mut self, state: CoordinatorState) {
        if self.state == state {
            return;
        }
        tracing::debug!(from = %self.state, to = %state, "state transition");
        self.state = state;
        self.sink.state_changed(state);
    }

    fn emit(&mut self, event: FeedbackEvent) {
        // Steady conditions are shown once, not once per tick
        let repeat = match (&self.last_event, &event) {
            (Some(FeedbackEvent::Waiting), FeedbackEvent::Waiting) => true,
            (Some(FeedbackEvent::Unrecognized { .. }), FeedbackEvent::Unrecognized { .. }) => true,
            (Some(last @ FeedbackEvent::Error { .. }), FeedbackEvent::Error { .. }) => {
                *last == event
            }
            _ => false,
        };
        if repeat {
            return;
        }
        self.last_event = Some(event.clone());
        self.sink.emit(event);
    }
}
