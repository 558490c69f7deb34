//! Face detector interface.
//!
//! Model loading and inference live outside this crate. A detector yields
//! the faces found in the current frame, at most once per tick.

use std::future::Future;

use thiserror::Error;

use crate::types::FaceDetection;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DetectError {
    /// This frame is lost; the next tick may succeed.
    #[error("transient detector failure: {0}")]
    Transient(String),
    /// The detector will not recover without re-initialization.
    #[error("fatal detector failure: {0}")]
    Fatal(String),
}

impl DetectError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, DetectError::Fatal(_))
    }
}

pub trait Detector: Send {
    /// Faces in the current frame. An empty list means no face is in view.
    fn detect_faces(
        &mut self,
    ) -> impl Future<Output = Result<Vec<FaceDetection>, DetectError>> + Send;
}

/// The face the pipeline acts on: the first one reported.
pub fn subject(faces: &[FaceDetection]) -> Option<&FaceDetection> {
    faces.first()
}
