use serde::{Deserialize, Serialize};

/// Bounding box of a detected face in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub top: i64,
    pub right: i64,
    pub bottom: i64,
    pub left: i64,
}

/// Face embedding vector (128-dimensional for dlib-style encoders).
///
/// Produced only by an [`EmbeddingProvider`](crate::EmbeddingProvider) and
/// never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Number of dimensions.
    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Compute Euclidean distance between two embeddings.
    ///
    /// Embeddings of different dimensionality are never comparable and
    /// report an infinite distance.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        if self.values.len() != other.values.len() {
            return f32::INFINITY;
        }
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// One face returned by the embedding provider for an image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedFace {
    pub bounding_box: BoundingBox,
    pub embedding: Embedding,
}

/// A single enrolled reference embedding.
///
/// A label owns one entry per face found in its enrollment images.
#[derive(Debug, Clone, PartialEq)]
pub struct GalleryEntry {
    pub label: String,
    pub embedding: Embedding,
}

/// Outcome of identifying one unknown embedding against the gallery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchResult {
    /// Winning label, or `None` when no entry lies within the threshold.
    pub label: Option<String>,
    /// Number of gallery entries of the winning label within the threshold.
    pub confidence_votes: usize,
}

impl MatchResult {
    pub fn unknown() -> Self {
        Self {
            label: None,
            confidence_votes: 0,
        }
    }

    pub fn is_match(&self) -> bool {
        self.label.is_some()
    }

    /// Operator-facing name: the label, or "Unknown".
    pub fn display_label(&self) -> &str {
        self.label.as_deref().unwrap_or("Unknown")
    }
}
