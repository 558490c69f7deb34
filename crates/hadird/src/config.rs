use std::path::PathBuf;
use std::time::Duration;

use hadir_core::{CoordinatorConfig, LivenessConfig};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("{name} must be a positive finite number (got {value})")]
    NotPositive { name: &'static str, value: String },
}

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// JSON-lines detection source written by the external detector (usually a FIFO).
    pub detector_source: PathBuf,
    /// Minimum cumulative face path length (pixels) across the window for liveness.
    pub movement_threshold: f32,
    /// Minimum number of frames before liveness can be confirmed.
    pub frame_threshold: u32,
    /// Number of face positions kept in the liveness window.
    pub window_capacity: usize,
    /// Maximum Euclidean descriptor distance for a positive match.
    pub match_threshold: f32,
    /// Detection tick period in milliseconds.
    pub tick_interval_ms: u64,
    /// Whether motion liveness is required (disable for demos only).
    pub liveness_enabled: bool,
    /// Seconds of post-commit countdown before the next session starts.
    pub countdown_secs: u32,
    /// How long one tick waits for a fresh frame before counting it as lost.
    pub frame_timeout_ms: u64,
    /// Consecutive lost ticks after which the detector is considered dead.
    pub max_detector_failures: u32,
    /// Whether the daemon is running on the session bus (development mode).
    /// Caller UID checks are skipped on the session bus.
    pub session_bus: bool,
}

impl Config {
    /// Load configuration from `HADIR_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("hadir");

        let db_path = std::env::var("HADIR_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("attendance.db"));

        let defaults = CoordinatorConfig::default();

        Self {
            db_path,
            detector_source: std::env::var("HADIR_DETECTOR_SOURCE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/run/hadir/detections")),
            movement_threshold: env_parse(
                "HADIR_MOVEMENT_THRESHOLD",
                defaults.liveness.movement_threshold,
            ),
            frame_threshold: env_parse("HADIR_FRAME_THRESHOLD", defaults.liveness.frame_threshold),
            window_capacity: env_parse("HADIR_WINDOW_CAPACITY", defaults.liveness.window_capacity),
            match_threshold: env_parse("HADIR_MATCH_THRESHOLD", defaults.match_threshold),
            tick_interval_ms: env_parse("HADIR_TICK_INTERVAL_MS", 100),
            liveness_enabled: std::env::var("HADIR_LIVENESS_ENABLED")
                .map(|v| v != "0")
                .unwrap_or(true),
            countdown_secs: env_parse("HADIR_COUNTDOWN_SECS", defaults.countdown_secs),
            frame_timeout_ms: env_parse("HADIR_FRAME_TIMEOUT_MS", 1000),
            max_detector_failures: env_parse("HADIR_MAX_DETECTOR_FAILURES", 30),
            session_bus: std::env::var("HADIR_SESSION_BUS").is_ok(),
        }
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive_f32("HADIR_MOVEMENT_THRESHOLD", self.movement_threshold)?;
        positive_f32("HADIR_MATCH_THRESHOLD", self.match_threshold)?;
        positive_u64("HADIR_FRAME_THRESHOLD", self.frame_threshold as u64)?;
        positive_u64("HADIR_WINDOW_CAPACITY", self.window_capacity as u64)?;
        positive_u64("HADIR_TICK_INTERVAL_MS", self.tick_interval_ms)?;
        positive_u64("HADIR_FRAME_TIMEOUT_MS", self.frame_timeout_ms)?;
        positive_u64("HADIR_MAX_DETECTOR_FAILURES", self.max_detector_failures as u64)?;
        Ok(())
    }

    pub fn coordinator(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            liveness: LivenessConfig {
                movement_threshold: self.movement_threshold,
                frame_threshold: self.frame_threshold,
                window_capacity: self.window_capacity,
            },
            match_threshold: self.match_threshold,
            liveness_enabled: self.liveness_enabled,
            countdown_secs: self.countdown_secs,
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn positive_f32(name: &'static str, value: f32) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::NotPositive {
            name,
            value: value.to_string(),
        })
    }
}

fn positive_u64(name: &'static str, value: u64) -> Result<(), ConfigError> {
    if value > 0 {
        Ok(())
    } else {
        Err(ConfigError::NotPositive {
            name,
            value: value.to_string(),
        })
    }
}
