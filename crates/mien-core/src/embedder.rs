//! ArcFace face embedder via ONNX Runtime.
//!
//! Embeds a padded square crop of the detected face; the output embedding is
//! L2-normalized so downstream cosine scores are dot products of unit vectors.

use crate::types::{Detection, Embedding};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const EMBED_INPUT_SIZE: u32 = 112;
const EMBED_MEAN: f32 = 127.5;
const EMBED_STD: f32 = 127.5;

/// Output dimensionality of the w600k_r50 recognition model. Every stored
/// vector shares this length.
pub const EMBEDDING_DIM: usize = 512;

/// Margin added around the detected box before cropping, as a fraction of
/// the box's larger side.
const CROP_MARGIN: f32 = 0.2;

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("model file not found: {0} — download w600k_r50.onnx from insightface and place it in the model dir")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// ArcFace-based face embedder.
pub struct FaceEmbedder {
    session: Session,
}

impl FaceEmbedder {
    /// Load the recognition ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, EmbedderError> {
        if !Path::new(model_path).exists() {
            return Err(EmbedderError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(path = model_path, "loaded recognition model");
        Ok(Self { session })
    }

    /// Extract an embedding for one detected face.
    pub fn extract(&mut self, photo: &RgbImage, face: &Detection) -> Result<Embedding, EmbedderError> {
        let crop = crop_face(photo, face);
        let input = preprocess(&crop);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedderError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != EMBEDDING_DIM {
            return Err(EmbedderError::InferenceFailed(format!(
                "expected {EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
        let values = if norm > 0.0 {
            raw.iter().map(|x| x / norm).collect()
        } else {
            raw.to_vec()
        };

        Ok(Embedding { values })
    }
}

/// Expand the detection to a padded square, clamp it to the photo bounds,
/// and resize to the embedder input size.
fn crop_face(photo: &RgbImage, face: &Detection) -> RgbImage {
    let (width, height) = photo.dimensions();
    let side = face.width.max(face.height) * (1.0 + CROP_MARGIN);
    let cx = face.x + face.width / 2.0;
    let cy = face.y + face.height / 2.0;

    let x0 = (cx - side / 2.0).max(0.0) as u32;
    let y0 = (cy - side / 2.0).max(0.0) as u32;
    let x1 = ((cx + side / 2.0).min(width as f32) as u32).min(width);
    let y1 = ((cy + side / 2.0).min(height as f32) as u32).min(height);
    let crop_w = x1.saturating_sub(x0).max(1);
    let crop_h = y1.saturating_sub(y0).max(1);

    let crop = image::imageops::crop_imm(photo, x0, y0, crop_w, crop_h).to_image();
    image::imageops::resize(
        &crop,
        EMBED_INPUT_SIZE,
        EMBED_INPUT_SIZE,
        image::imageops::FilterType::Triangle,
    )
}

/// Build the normalized NCHW tensor from a 112×112 RGB crop.
fn preprocess(crop: &RgbImage) -> Array4<f32> {
    let size = EMBED_INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

    for (x, y, pixel) in crop.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - EMBED_MEAN) / EMBED_STD;
        }
    }

    tensor
}
