//! Core of the Hadir face attendance pipeline.
//!
//! Turns a stream of per-frame face detections into one attendance commit:
//! motion-based liveness ([`liveness`]), nearest-neighbour identity matching
//! ([`matcher`]) and the state machine tying them together ([`coordinator`]).
//! Detection, persistence and display are collaborators behind the traits in
//! [`detector`], [`store`] and [`feedback`].

pub mod coordinator;
pub mod detector;
pub mod feedback;
pub mod liveness;
pub mod matcher;
pub mod store;
pub mod types;

pub use coordinator::{
    AttendanceCoordinator, AttendanceSession, CoordinatorConfig, CoordinatorState, Step,
};
pub use detector::{DetectError, Detector};
pub use feedback::{render, FeedbackEvent, FeedbackSink, Render, Tone};
pub use liveness::{LivenessConfig, LivenessStatus, MotionLivenessTracker};
pub use matcher::{IdentityMatcher, MatchResult};
pub use store::AttendanceStore;
pub use types::{
    AttendanceRecord, Descriptor, DescriptorError, EnrolledIdentity, FaceDetection,
    PositionSample, Rect, DESCRIPTOR_DIM, STATUS_PRESENT,
};
