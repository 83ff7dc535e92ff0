use serde::{Deserialize, Serialize};

/// Face embedding vector (512-dimensional for the w600k_r50 model).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    /// Cosine similarity against a raw stored vector.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar. A zero-norm vector
    /// on either side yields 0.0 rather than NaN.
    pub fn similarity(&self, other: &[f32]) -> f32 {
        cosine(&self.values, other)
    }
}

/// Cosine similarity between two raw vectors.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom > 0.0 {
        dot / denom
    } else {
        0.0
    }
}

/// A stored (label, vector) pair.
///
/// The store file is a JSON array of these; records are immutable once
/// written and are never deleted by the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceRecord {
    pub label: String,
    pub vector: Vec<f32>,
}

/// A detected face in photo coordinates.
#[derive(Debug, Clone)]
pub struct Detection {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}
