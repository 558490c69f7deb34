//! Motion-based liveness detection over a sliding window of face positions.
//!
//! A face held still in front of the camera for a few seconds still drifts:
//! the head sways, the subject shifts weight, the detector box jitters. This
//! module accumulates the *path length* travelled by the face box center
//! across the most recent frames and calls the subject live once enough
//! frames have been seen and enough motion has accumulated.
//!
//! Path length, not net displacement, is measured: a face oscillating around
//! one point keeps adding evidence instead of cancelling out.
//!
//! # Threat Coverage
//!
//! - **Blocks:** A printed photograph or a paused screen held perfectly still.
//! - **Does not block:** A photo panned by hand, video replay, masks. Any
//!   stimulus that moves satisfies the heuristic. This is a best-effort gate,
//!   not anti-spoofing.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::types::PositionSample;

/// Default cumulative path length (frame pixels) required across the window.
pub const DEFAULT_MOVEMENT_THRESHOLD: f32 = 5.0;
/// Default number of updates required before the subject can be verified.
pub const DEFAULT_FRAME_THRESHOLD: u32 = 15;
/// Default number of positions kept in the sliding window.
pub const DEFAULT_WINDOW_CAPACITY: usize = 30;

/// Tunable thresholds for [`MotionLivenessTracker`].
///
/// The defaults are empirical and carry no derivation; treat them as starting
/// points for a given camera and mounting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LivenessConfig {
    pub movement_threshold: f32,
    pub frame_threshold: u32,
    pub window_capacity: usize,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            movement_threshold: DEFAULT_MOVEMENT_THRESHOLD,
            frame_threshold: DEFAULT_FRAME_THRESHOLD,
            window_capacity: DEFAULT_WINDOW_CAPACITY,
        }
    }
}

/// Snapshot of the tracker for display.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LivenessStatus {
    pub verified: bool,
    /// Updates since the last reset; not bounded by the window capacity.
    pub frame_count: u32,
    /// Sum of Euclidean distances between consecutive window samples.
    pub movement: f32,
    /// `min(frame_count / frame_threshold, 1)`. UI only.
    pub progress: f32,
}

/// Sliding-window motion tracker. Verification is sticky until [`reset`](Self::reset).
#[derive(Debug, Clone)]
pub struct MotionLivenessTracker {
    config: LivenessConfig,
    samples: VecDeque<PositionSample>,
    frame_count: u32,
    verified: bool,
}

impl MotionLivenessTracker {
    pub fn new(config: LivenessConfig) -> Self {
        Self {
            samples: VecDeque::with_capacity(config.window_capacity + 1),
            config,
            frame_count: 0,
            verified: false,
        }
    }

    /// Record one face position.
    ///
    /// Returns `true` only on the update where the subject newly becomes
    /// verified; every other update, including those after verification,
    /// returns `false`.
    pub fn update(&mut self, position: PositionSample) -> bool {
        self.samples.push_back(position);
        while self.samples.len() > self.config.window_capacity {
            self.samples.pop_front();
        }
        self.frame_count = self.frame_count.saturating_add(1);

        if self.verified {
            return false;
        }

        if self.frame_count >= self.config.frame_threshold
            && self.movement() > self.config.movement_threshold
        {
            self.verified = true;
            return true;
        }
        false
    }

    /// Discard all evidence.
    pub fn reset(&mut self) {
        self.samples.clear();
        self.frame_count = 0;
        self.verified = false;
    }

    pub fn is_verified(&self) -> bool {
        self.verified
    }

    /// Path length across the window. Zero with fewer than two samples.
    pub fn movement(&self) -> f32 {
        self.samples
            .iter()
            .zip(self.samples.iter().skip(1))
            .map(|(a, b)| a.distance(b))
            .sum()
    }

    pub fn status(&self) -> LivenessStatus {
        let progress = if self.config.frame_threshold == 0 {
            1.0
        } else {
            (self.frame_count as f32 / self.config.frame_threshold as f32).min(1.0)
        };
        LivenessStatus {
            verified: self.verified,
            frame_count: self.frame_count,
            movement: self.movement(),
            progress,
        }
    }

    pub fn config(&self) -> &LivenessConfig {
        &self.config
    }

    pub fn window_len(&self) -> usize {
        self.samples.len()
    }
}

impl Default for MotionLivenessTracker {
    fn default() -> Self {
        Self::new(LivenessConfig::default())
    }
}
