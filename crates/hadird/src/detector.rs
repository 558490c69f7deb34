//! Detection source reader.
//!
//! Face inference runs in an external process that writes one JSON line per
//! processed frame to a path, usually a FIFO:
//!
//! ```text
//! {"faces":[{"box":{"x":120,"y":80,"width":160,"height":160},"descriptor":[...128 floats]}]}
//! {"error":"inference failed"}
//! ```
//!
//! A dedicated OS thread reads the source and publishes only the newest frame;
//! frames the tick loop did not get to are overwritten.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::Duration;

use hadir_core::{DetectError, Detector, FaceDetection};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("detection source unavailable: {path}: {source}")]
    Unavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to spawn detector thread: {0}")]
    Spawn(#[source] std::io::Error),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DetectionLine {
    Faces { faces: Vec<FaceDetection> },
    Error { error: String },
}

/// Faces of one frame, or the reason the frame is unusable.
type Frame = Result<Vec<FaceDetection>, String>;

/// Tick-side handle to the detector thread.
pub struct DetectorHandle {
    rx: watch::Receiver<Option<Frame>>,
    frame_timeout: Duration,
}

/// Spawn the reader thread for `source`.
///
/// Fails fast if the source does not exist. Opening happens on the thread,
/// since opening a FIFO blocks until the writer shows up.
pub fn spawn_detector(source: &Path, frame_timeout: Duration) -> Result<DetectorHandle, DetectorError> {
    std::fs::metadata(source).map_err(|e| DetectorError::Unavailable {
        path: source.to_path_buf(),
        source: e,
    })?;

    let (tx, rx) = watch::channel(None);
    let path = source.to_path_buf();

    std::thread::Builder::new()
        .name("hadir-detector".into())
        .spawn(move || {
            tracing::info!(path = %path.display(), "detector thread started");
            match File::open(&path) {
                Ok(file) => read_frames(BufReader::new(file), &tx),
                Err(e) => tracing::error!(error = %e, "failed to open detection source"),
            }
            tracing::info!("detector thread exiting");
        })
        .map_err(DetectorError::Spawn)?;

    Ok(DetectorHandle { rx, frame_timeout })
}

fn read_frames(reader: impl BufRead, tx: &watch::Sender<Option<Frame>>) {
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(error = %e, "detection source read failed");
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        if tx.send(Some(parse_line(&line))).is_err() {
            // Tick loop is gone
            return;
        }
    }
    tracing::warn!("detection source reached end of stream");
}

fn parse_line(line: &str) -> Frame {
    match serde_json::from_str::<DetectionLine>(line) {
        Ok(DetectionLine::Faces { faces }) => Ok(faces),
        Ok(DetectionLine::Error { error }) => Err(error),
        Err(e) => Err(format!("malformed detection line: {e}")),
    }
}

impl Detector for DetectorHandle {
    async fn detect_faces(&mut self) -> Result<Vec<FaceDetection>, DetectError> {
        match tokio::time::timeout(self.frame_timeout, self.rx.changed()).await {
            Err(_) => {
                return Err(DetectError::Transient(format!(
                    "no frame within {}ms",
                    self.frame_timeout.as_millis()
                )))
            }
            Ok(Err(_)) => {
                return Err(DetectError::Fatal("detection source closed".to_string()));
            }
            Ok(Ok(())) => {}
        }

        let frame = self.rx.borrow_and_update().clone();
        match frame {
            Some(Ok(faces)) => Ok(faces),
            Some(Err(message)) => Err(DetectError::Transient(message)),
            None => Err(DetectError::Transient("no frame yet".to_string())),
        }
    }
}
