use std::sync::Arc;

use hadir_core::{render, AttendanceRecord, CoordinatorState, FeedbackEvent, FeedbackSink, Render};
use serde::Serialize;
use tokio::sync::watch;

/// What the daemon currently shows, as reported by `Status()`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusSnapshot {
    pub state: CoordinatorState,
    pub render: Render,
    pub last_event: Option<FeedbackEvent>,
    pub sessions_completed: u64,
    pub last_commit: Option<AttendanceRecord>,
}

/// Feedback sink that logs every event and publishes the latest render.
#[derive(Clone)]
pub struct StatusSink {
    board: Arc<watch::Sender<StatusSnapshot>>,
}

impl StatusSink {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(StatusSnapshot::default());
        Self {
            board: Arc::new(tx),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.board.subscribe()
    }
}

impl Default for StatusSink {
    fn default() -> Self {
        Self::new()
    }
}

impl FeedbackSink for StatusSink {
    fn emit(&mut self, event: FeedbackEvent) {
        let view = render(&event);
        match &event {
            // Ten per second while verifying
            FeedbackEvent::Verifying { .. } => {
                tracing::debug!(event = event.kind(), text = %view.message, "feedback")
            }
            FeedbackEvent::Error { .. } => {
                tracing::warn!(event = event.kind(), text = %view.message, "feedback")
            }
            _ => tracing::info!(event = event.kind(), text = %view.message, "feedback"),
        }
        self.board.send_modify(|s| {
            s.render = view;
            s.last_event = Some(event);
        });
    }

    fn state_changed(&mut self, state: CoordinatorState) {
        self.board.send_modify(|s| s.state = state);
    }

    fn navigate_away(&mut self, record: &AttendanceRecord) {
        tracing::info!(label = %record.label, date = %record.date, time = %record.time, "session complete");
        self.board.send_modify(|s| {
            s.sessions_completed += 1;
            s.last_commit = Some(record.clone());
        });
    }
}
