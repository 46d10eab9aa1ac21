use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmbeddingError {
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Bounding box for a detected face, in source image pixels.
///
/// `x`/`y` are the top-left corner, so `top = y`, `left = x`,
/// `bottom = y + height`, `right = x + width`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl BoundingBox {
    /// Build a box from (top, right, bottom, left) edges.
    pub fn from_edges(top: f32, right: f32, bottom: f32, left: f32) -> Self {
        Self {
            x: left,
            y: top,
            width: right - left,
            height: bottom - top,
            confidence: 1.0,
        }
    }

    pub fn top(&self) -> f32 {
        self.y
    }

    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    pub fn left(&self) -> f32 {
        self.x
    }

    /// `(bottom - top) * (right - left)`. Inverted edges count as zero extent.
    pub fn area(&self) -> f32 {
        let height = (self.bottom() - self.top()).max(0.0);
        let width = (self.right() - self.left()).max(0.0);
        height * width
    }
}

/// Face embedding vector (512-dimensional for ArcFace, 128 for dlib models).
///
/// Immutable once built; serializes as a bare JSON array of numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    values: Vec<f64>,
}

impl Embedding {
    pub fn new(values: Vec<f64>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Compute Euclidean (L2) distance between two embeddings.
    ///
    /// Always >= 0. Embeddings of different dimensionality are rejected
    /// rather than truncated.
    pub fn euclidean_distance(&self, other: &Embedding) -> Result<f64, EmbeddingError> {
        if self.dim() != other.dim() {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.dim(),
                actual: other.dim(),
            });
        }

        Ok(self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f64>()
            .sqrt())
    }
}

impl From<Vec<f64>> for Embedding {
    fn from(values: Vec<f64>) -> Self {
        Self::new(values)
    }
}

/// One face found in an image: where it is and what it looks like.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub region: BoundingBox,
    pub embedding: Embedding,
}

/// Opaque identity attached to a gallery record.
///
/// The HTTP service uses integer user ids; offline galleries may use names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Identity {
    Id(i64),
    Name(String),
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Id(id) => write!(f, "{id}"),
            Identity::Name(name) => f.write_str(name),
        }
    }
}

impl From<i64> for Identity {
    fn from(id: i64) -> Self {
        Identity::Id(id)
    }
}

impl From<&str> for Identity {
    fn from(name: &str) -> Self {
        Identity::Name(name.to_string())
    }
}

/// Outcome of matching one live image against a gallery.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum MatchDecision {
    Matched { identity: Identity, distance: f64 },
    NoMatch,
    NoFaceDetected,
}

impl MatchDecision {
    pub fn is_match(&self) -> bool {
        matches!(self, MatchDecision::Matched { .. })
    }

    /// The matched identity, if any.
    pub fn identity(&self) -> Option<&Identity> {
        match self {
            MatchDecision::Matched { identity, .. } => Some(identity),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rstest::rstest;

    fn emb(values: &[f64]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    #[test]
    fn test_distance_to_self_is_zero() {
        let a = emb(&[0.12, -0.5, 0.33, 0.9]);
        assert_eq!(a.euclidean_distance(&a).unwrap(), 0.0);
    }

    #[rstest]
    #[case(&[0.0, 0.0], &[3.0, 4.0])]
    #[case(&[1.5, -2.0, 0.25], &[-0.75, 0.5, 3.0])]
    #[case(&[0.1; 128], &[0.2; 128])]
    fn test_distance_is_symmetric(#[case] a: &[f64], #[case] b: &[f64]) {
        let (a, b) = (emb(a), emb(b));
        assert_eq!(
            a.euclidean_distance(&b).unwrap(),
            b.euclidean_distance(&a).unwrap()
        );
    }

    #[test]
    fn test_distance_three_four_five() {
        let d = emb(&[0.0, 0.0]).euclidean_distance(&emb(&[3.0, 4.0])).unwrap();
        assert_relative_eq!(d, 5.0);
    }

    #[test]
    fn test_distance_dimension_mismatch() {
        let err = emb(&[1.0, 2.0]).euclidean_distance(&emb(&[1.0])).unwrap_err();
        assert_eq!(err, EmbeddingError::DimensionMismatch { expected: 2, actual: 1 });
    }

    #[rstest]
    #[case(BoundingBox::from_edges(0.0, 10.0, 10.0, 0.0), 100.0)]
    #[case(BoundingBox::from_edges(5.0, 15.0, 10.0, 5.0), 50.0)]
    #[case(BoundingBox::from_edges(4.0, 4.0, 4.0, 4.0), 0.0)]
    #[case(BoundingBox::from_edges(10.0, 0.0, 0.0, 10.0), 0.0)]
    fn test_bbox_area(#[case] bbox: BoundingBox, #[case] expected: f32) {
        assert_relative_eq!(bbox.area(), expected);
    }

    #[test]
    fn test_identity_serde_untagged() {
        let id: Identity = serde_json::from_str("42").unwrap();
        assert_eq!(id, Identity::Id(42));
        let name: Identity = serde_json::from_str("\"alice\"").unwrap();
        assert_eq!(name, Identity::Name("alice".into()));
        assert_eq!(id.to_string(), "42");
        assert_eq!(name.to_string(), "alice");
    }

    #[test]
    fn test_embedding_serializes_as_array() {
        let json = serde_json::to_string(&emb(&[0.5, -1.25])).unwrap();
        assert_eq!(json, "[0.5,-1.25]");
    }
}
