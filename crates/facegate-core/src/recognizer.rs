//! ArcFace face recognizer via ONNX Runtime.
//!
//! Crops a square around each detected face, resizes it to 112x112 and
//! extracts a 512-dimensional L2-normalized embedding (w600k_r50).

use crate::types::{BoundingBox, Embedding};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ARCFACE_INPUT_SIZE: u32 = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5;
const ARCFACE_EMBEDDING_DIM: usize = 512;
/// Extra context around the detector box, as a fraction of its longer side.
const CROP_MARGIN: f32 = 0.1;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face region {0:?} does not overlap the image")]
    EmptyCrop(BoundingBox),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// ArcFace-based face recognizer.
pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(path = %model_path.display(), "loaded ArcFace model");

        Ok(Self { session })
    }

    /// Extract an embedding for one detected face.
    pub fn embed(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<Embedding, RecognizerError> {
        let crop = crop_face(image, face).ok_or(RecognizerError::EmptyCrop(*face))?;
        let input = preprocess(&crop);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(Embedding::new(l2_normalize(raw)))
    }
}

/// Square crop centred on the face, clamped to the image, resized to 112x112.
///
/// Returns `None` when the clamped crop is empty.
fn crop_face(image: &RgbImage, face: &BoundingBox) -> Option<RgbImage> {
    let side = face.width.max(face.height) * (1.0 + 2.0 * CROP_MARGIN);
    let cx = face.x + face.width / 2.0;
    let cy = face.y + face.height / 2.0;

    let x0 = (cx - side / 2.0).max(0.0).floor() as u32;
    let y0 = (cy - side / 2.0).max(0.0).floor() as u32;
    let x1 = ((cx + side / 2.0).ceil().max(0.0) as u32).min(image.width());
    let y1 = ((cy + side / 2.0).ceil().max(0.0) as u32).min(image.height());

    if x1 <= x0 || y1 <= y0 {
        return None;
    }

    let region = imageops::crop_imm(image, x0, y0, x1 - x0, y1 - y0).to_image();
    Some(imageops::resize(
        &region,
        ARCFACE_INPUT_SIZE,
        ARCFACE_INPUT_SIZE,
        FilterType::Triangle,
    ))
}

/// Convert a 112x112 RGB crop into a normalized NCHW tensor.
fn preprocess(face: &RgbImage) -> Array4<f32> {
    let size = ARCFACE_INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in face.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
        }
    }
    tensor
}

fn l2_normalize(raw: &[f32]) -> Vec<f64> {
    let norm = raw.iter().map(|&x| (x as f64).powi(2)).sum::<f64>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|&x| x as f64 / norm).collect()
    } else {
        raw.iter().map(|&x| x as f64).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_crop_face_output_size() {
        let image = RgbImage::new(200, 100);
        let face = BoundingBox { x: 50.0, y: 20.0, width: 40.0, height: 60.0, confidence: 0.9 };
        let crop = crop_face(&image, &face).unwrap();
        assert_eq!(crop.dimensions(), (ARCFACE_INPUT_SIZE, ARCFACE_INPUT_SIZE));
    }

    #[test]
    fn test_crop_face_outside_image() {
        let image = RgbImage::new(100, 100);
        let face = BoundingBox { x: 300.0, y: 300.0, width: 20.0, height: 20.0, confidence: 0.9 };
        assert!(crop_face(&image, &face).is_none());
    }

    #[test]
    fn test_preprocess_channel_order() {
        let face = RgbImage::from_pixel(ARCFACE_INPUT_SIZE, ARCFACE_INPUT_SIZE, image::Rgb([255, 0, 128]));
        let tensor = preprocess(&face);
        assert_eq!(tensor.shape(), &[1, 3, 112, 112]);
        assert_relative_eq!(tensor[[0, 0, 5, 5]], 1.0);
        assert_relative_eq!(tensor[[0, 1, 5, 5]], -1.0);
        assert_relative_eq!(tensor[[0, 2, 5, 5]], (128.0 - ARCFACE_MEAN) / ARCFACE_STD);
    }

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(&[3.0, 4.0]);
        assert_relative_eq!(v[0], 0.6);
        assert_relative_eq!(v[1], 0.8);
        assert_eq!(l2_normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    }
}
