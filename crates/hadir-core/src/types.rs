use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Length of a face descriptor produced by the detector.
pub const DESCRIPTOR_DIM: usize = 128;

/// Attendance status written for every committed record.
pub const STATUS_PRESENT: &str = "present";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DescriptorError {
    #[error("invalid descriptor dimension: {0} (expected 128)")]
    InvalidDim(usize),
    #[error("invalid descriptor value (NaN/Inf)")]
    InvalidValue,
    #[error("descriptor is not a JSON array of numbers: {0}")]
    Json(String),
}

/// Identity embedding of one face: exactly [`DESCRIPTOR_DIM`] finite values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f32>", into = "Vec<f32>")]
pub struct Descriptor {
    values: Vec<f32>,
}

impl Descriptor {
    pub fn new(values: Vec<f32>) -> Result<Self, DescriptorError> {
        if values.len() != DESCRIPTOR_DIM {
            return Err(DescriptorError::InvalidDim(values.len()));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(DescriptorError::InvalidValue);
        }
        Ok(Self { values })
    }

    /// Parse a descriptor from a JSON array such as `[0.01, -0.2, ...]`.
    pub fn from_json(text: &str) -> Result<Self, DescriptorError> {
        let values: Vec<f32> =
            serde_json::from_str(text).map_err(|e| DescriptorError::Json(e.to_string()))?;
        Self::new(values)
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Euclidean distance to another descriptor.
    pub fn distance(&self, other: &Descriptor) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f32>()
            .sqrt()
    }
}

impl TryFrom<Vec<f32>> for Descriptor {
    type Error = DescriptorError;

    fn try_from(values: Vec<f32>) -> Result<Self, Self::Error> {
        Self::new(values)
    }
}

impl From<Descriptor> for Vec<f32> {
    fn from(d: Descriptor) -> Self {
        d.values
    }
}

/// Face position in frame coordinates (box center).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionSample {
    pub x: f32,
    pub y: f32,
}

impl PositionSample {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &PositionSample) -> f32 {
        let dx = other.x - self.x;
        let dy = other.y - self.y;
        (dx * dx + dy * dy).sqrt()
    }
}

/// Face bounding box as reported by the detector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    pub fn center(&self) -> PositionSample {
        PositionSample::new(self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

/// One detected face in one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceDetection {
    #[serde(rename = "box")]
    pub bbox: Rect,
    pub descriptor: Descriptor,
}

/// An enrolled person the matcher can recognize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrolledIdentity {
    /// Unique enrollment key (e.g. student number).
    pub label: String,
    /// Display name.
    pub name: String,
    pub descriptor: Descriptor,
}

/// A committed attendance event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub id: String,
    pub label: String,
    pub name: String,
    /// Local weekday name, e.g. "Monday".
    pub weekday: String,
    /// Local date, `YYYY-MM-DD`.
    pub date: String,
    /// Local time, `HH:MM:SS`.
    pub time: String,
    pub status: String,
    /// RFC 3339 UTC timestamp.
    pub created_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_rejects_wrong_dimension() {
        let err = Descriptor::new(vec![0.0; 64]).unwrap_err();
        assert_eq!(err, DescriptorError::InvalidDim(64));
    }

    #[test]
    fn descriptor_rejects_nan() {
        let mut values = vec![0.1; DESCRIPTOR_DIM];
        values[7] = f32::NAN;
        assert_eq!(
            Descriptor::new(values).unwrap_err(),
            DescriptorError::InvalidValue
        );
    }

    #[test]
    fn descriptor_from_json() {
        let text = serde_json::to_string(&vec![0.25f32; DESCRIPTOR_DIM]).unwrap();
        let d = Descriptor::from_json(&text).unwrap();
        assert_eq!(d.values().len(), DESCRIPTOR_DIM);
        assert!(matches!(
            Descriptor::from_json("{\"a\":1}"),
            Err(DescriptorError::Json(_))
        ));
    }

    #[test]
    fn descriptor_distance_known_geometry() {
        let a = Descriptor::new(vec![0.0; DESCRIPTOR_DIM]).unwrap();
        let mut v = vec![0.0; DESCRIPTOR_DIM];
        v[0] = 3.0;
        v[1] = 4.0;
        let b = Descriptor::new(v).unwrap();
        assert!((a.distance(&b) - 5.0).abs() < 1e-6);
        assert_eq!(a.distance(&a), 0.0);
    }

    #[test]
    fn face_detection_parses_box_key() {
        let json = format!(
            "{{\"box\":{{\"x\":10,\"y\":20,\"width\":100,\"height\":50}},\"descriptor\":{}}}",
            serde_json::to_string(&vec![0.0f32; DESCRIPTOR_DIM]).unwrap()
        );
        let face: FaceDetection = serde_json::from_str(&json).unwrap();
        assert_eq!(face.bbox.center(), PositionSample::new(60.0, 45.0));
    }

    #[test]
    fn face_detection_rejects_short_descriptor() {
        let json = "{\"box\":{\"x\":0,\"y\":0,\"width\":1,\"height\":1},\"descriptor\":[1.0,2.0]}";
        assert!(serde_json::from_str::<FaceDetection>(json).is_err());
    }
}
