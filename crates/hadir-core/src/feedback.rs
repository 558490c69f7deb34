//! Feedback events emitted by the coordinator and their render description.
//!
//! The presentation layer is external; [`render`] maps each event to a
//! toolkit-neutral description it can draw.

use serde::Serialize;

use crate::coordinator::CoordinatorState;
use crate::types::AttendanceRecord;

/// Events for the person in front of the camera, in emission order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FeedbackEvent {
    /// No face in frame.
    Waiting,
    /// Liveness evidence is accumulating.
    Verifying {
        frame_count: u32,
        frame_threshold: u32,
        progress: f32,
    },
    /// Liveness confirmed. Once per verification cycle.
    Verified,
    /// Live face, but no enrolled identity within the match threshold.
    Unrecognized { distance: f32 },
    /// Attendance commit started.
    Submitting { label: String, name: String },
    /// Attendance committed; `countdown` seconds until the session ends.
    Committed {
        label: String,
        name: String,
        countdown: u32,
    },
    Error { message: String },
}

impl FeedbackEvent {
    /// Stable name of the event kind.
    pub fn kind(&self) -> &'static str {
        match self {
            FeedbackEvent::Waiting => "waiting",
            FeedbackEvent::Verifying { .. } => "verifying",
            FeedbackEvent::Verified => "verified",
            FeedbackEvent::Unrecognized { .. } => "unrecognized",
            FeedbackEvent::Submitting { .. } => "submitting",
            FeedbackEvent::Committed { .. } => "committed",
            FeedbackEvent::Error { .. } => "error",
        }
    }
}

/// Consumer of coordinator output. Implementations must not reorder or coalesce events.
pub trait FeedbackSink: Send {
    fn emit(&mut self, event: FeedbackEvent);

    fn state_changed(&mut self, _state: CoordinatorState) {}

    /// The session is over; the display should move on to the result page.
    fn navigate_away(&mut self, _record: &AttendanceRecord) {}
}

impl<T: FeedbackSink + ?Sized> FeedbackSink for &mut T {
    fn emit(&mut self, event: FeedbackEvent) {
        (**self).emit(event)
    }

    fn state_changed(&mut self, state: CoordinatorState) {
        (**self).state_changed(state)
    }

    fn navigate_away(&mut self, record: &AttendanceRecord) {
        (**self).navigate_away(record)
    }
}

/// Records events in order.
impl FeedbackSink for Vec<FeedbackEvent> {
    fn emit(&mut self, event: FeedbackEvent) {
        self.push(event);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tone {
    Info,
    Success,
    Error,
}

/// What the status area should show.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Render {
    pub tone: Tone,
    pub message: String,
    /// Progress bar fill in `0..=1`, when one applies.
    pub progress: Option<f32>,
}

impl Default for Render {
    fn default() -> Self {
        Self {
            tone: Tone::Info,
            message: "Starting...".to_string(),
            progress: None,
        }
    }
}

pub fn render(event: &FeedbackEvent) -> Render {
    let (tone, message, progress) = match event {
        FeedbackEvent::Waiting => (
            Tone::Info,
            "Point your face at the camera...".to_string(),
            None,
        ),
        FeedbackEvent::Verifying {
            frame_count,
            frame_threshold,
            progress,
        } => (
            Tone::Info,
            format!(
                "Checking liveness {}/{}: move your head slightly",
                frame_count.min(frame_threshold),
                frame_threshold
            ),
            Some(*progress),
        ),
        FeedbackEvent::Verified => (Tone::Success, "Liveness confirmed".to_string(), Some(1.0)),
        FeedbackEvent::Unrecognized { .. } => (
            Tone::Error,
            "Face not recognized. Please register first.".to_string(),
            None,
        ),
        FeedbackEvent::Submitting { name, .. } => (
            Tone::Info,
            format!("Recording attendance for {name}..."),
            None,
        ),
        FeedbackEvent::Committed {
            name, countdown, ..
        } => (
            Tone::Success,
            format!("{name}: attendance recorded. Continuing in {countdown}s"),
            None,
        ),
        FeedbackEvent::Error { message } => (Tone::Error, format!("Error: {message}"), None),
    };
    Render {
        tone,
        message,
        progress,
    }
}
