use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Bounding box for a detected face, in source-image pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }
}

/// Fixed-length face feature vector (128-dimensional for FaceNet).
///
/// Every fingerprint in one deployment shares the same length; comparing
/// fingerprints of different lengths is a programming error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub values: Vec<f32>,
}

impl Fingerprint {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Compute cosine similarity between two fingerprints.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar. A zero vector
    /// is similar to nothing (0.0).
    pub fn cosine(&self, other: &Fingerprint) -> f32 {
        debug_assert_eq!(self.dim(), other.dim(), "fingerprint dimension mismatch");
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            (dot / denom).clamp(-1.0, 1.0)
        } else {
            0.0
        }
    }

    /// Compute Euclidean distance between two fingerprints.
    pub fn euclidean_distance(&self, other: &Fingerprint) -> f32 {
        debug_assert_eq!(self.dim(), other.dim(), "fingerprint dimension mismatch");
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Serialize as packed little-endian `f32` (BLOB column format).
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Inverse of [`to_le_bytes`](Self::to_le_bytes). `None` if the length
    /// is not a multiple of four.
    pub fn from_le_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() % 4 != 0 {
            return None;
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Some(Self { values })
    }
}

/// Informational attributes of a registered person. Never used for matching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub reg_no: String,
    pub name: String,
    /// Semester or cohort label.
    pub cohort: String,
    pub phone: String,
}

/// A registered person: profile plus canonical fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub profile: Profile,
    pub fingerprint: Fingerprint,
}

impl Identity {
    pub fn key(&self) -> &str {
        &self.profile.reg_no
    }
}

/// Result of matching one probe fingerprint against the identity store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchDecision {
    /// Key of the matched identity, `None` for "unknown".
    pub reg_no: Option<String>,
    /// Best score seen, in the metric's "higher is better" convention.
    pub score: f32,
}

impl MatchDecision {
    pub fn unknown(score: f32) -> Self {
        Self { reg_no: None, score }
    }

    pub fn is_known(&self) -> bool {
        self.reg_no.is_some()
    }
}

/// One row of the attendance ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub reg_no: String,
    /// Display name, when the identity is known to the identity table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub marked_at: NaiveDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(values: &[f32]) -> Fingerprint {
        Fingerprint::new(values.to_vec())
    }

    #[test]
    fn test_cosine_identical() {
        let a = fp(&[1.0, 0.0, 0.0]);
        assert!((a.cosine(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        assert!(fp(&[1.0, 0.0]).cosine(&fp(&[0.0, 1.0])).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_opposite() {
        assert!((fp(&[1.0, 0.0]).cosine(&fp(&[-1.0, 0.0])) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_zero_vector() {
        assert_eq!(fp(&[0.0, 0.0]).cosine(&fp(&[1.0, 0.0])), 0.0);
    }

    #[test]
    fn test_cosine_ignores_magnitude() {
        let a = fp(&[1.0, 2.0, 3.0]);
        let b = fp(&[10.0, 20.0, 30.0]);
        assert!((a.cosine(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_euclidean_distance() {
        assert!((fp(&[0.0, 0.0]).euclidean_distance(&fp(&[3.0, 4.0])) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_blob_bytes_preserve_values() {
        let a = fp(&[0.5, -1.25, f32::MIN_POSITIVE, 1e9]);
        let bytes = a.to_le_bytes();
        assert_eq!(bytes.len(), 16);
        assert_eq!(Fingerprint::from_le_bytes(&bytes), Some(a));
    }

    #[test]
    fn test_blob_bytes_reject_ragged_length() {
        assert_eq!(Fingerprint::from_le_bytes(&[0, 1, 2]), None);
    }

    #[test]
    fn test_bbox_area_ignores_negative_extent() {
        let b = BoundingBox { x: 0.0, y: 0.0, width: -5.0, height: 10.0, confidence: 1.0 };
        assert_eq!(b.area(), 0.0);
    }
}
