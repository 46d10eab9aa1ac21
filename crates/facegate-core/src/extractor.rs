//! Embedding extraction capability: image in, detections out.
//!
//! The matcher and enrollment pipeline only see the [`EmbeddingExtractor`]
//! trait, so the model behind it can be swapped without touching them.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::Detection;
use image::RgbImage;
use std::path::{Path, PathBuf};
use thiserror::Error;

const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
const RECOGNIZER_MODEL_FILE: &str = "w600k_r50.onnx";

#[derive(Error, Debug)]
pub enum ExtractorError {
    #[error("image decode failed: {0}")]
    Decode(#[from] image::ImageError),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    /// Failure reported by an extractor that is not ONNX-backed.
    #[error("extractor backend: {0}")]
    Backend(String),
}

/// Turns a decoded image into zero or more face detections with embeddings.
///
/// An image without a face yields an empty vector, not an error. Every
/// embedding returned by one implementation has the same dimensionality.
pub trait EmbeddingExtractor {
    fn extract(&mut self, image: &RgbImage) -> Result<Vec<Detection>, ExtractorError>;
}

impl<E: EmbeddingExtractor + ?Sized> EmbeddingExtractor for Box<E> {
    fn extract(&mut self, image: &RgbImage) -> Result<Vec<Detection>, ExtractorError> {
        (**self).extract(image)
    }
}

/// Decode encoded image bytes (JPEG, PNG, ...) into an RGB raster.
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage, ExtractorError> {
    Ok(image::load_from_memory(bytes)?.to_rgb8())
}

/// Load an image file from disk into an RGB raster.
pub fn load_image(path: impl AsRef<Path>) -> Result<RgbImage, ExtractorError> {
    Ok(image::open(path)?.to_rgb8())
}

/// Default model directory: `$XDG_DATA_HOME/facegate/models`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facegate")
        .join("models")
}

/// SCRFD detection followed by ArcFace embedding of every detected face.
pub struct OnnxExtractor {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxExtractor {
    /// Load both models from `model_dir`.
    pub fn load(model_dir: &Path) -> Result<Self, ExtractorError> {
        let detector = FaceDetector::load(&model_dir.join(DETECTOR_MODEL_FILE))?;
        let recognizer = FaceRecognizer::load(&model_dir.join(RECOGNIZER_MODEL_FILE))?;
        Ok(Self { detector, recognizer })
    }
}

impl EmbeddingExtractor for OnnxExtractor {
    fn extract(&mut self, image: &RgbImage) -> Result<Vec<Detection>, ExtractorError> {
        let faces = self.detector.detect(image)?;
        tracing::debug!(faces = faces.len(), "detector pass complete");

        let mut detections = Vec::with_capacity(faces.len());
        for region in faces {
            let embedding = self.recognizer.embed(image, &region)?;
            detections.push(Detection { region, embedding });
        }
        Ok(detections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_decode_image_png() {
        let img = RgbImage::from_pixel(3, 2, image::Rgb([10, 20, 30]));
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();

        let decoded = decode_image(&bytes).unwrap();
        assert_eq!(decoded.dimensions(), (3, 2));
        assert_eq!(decoded.get_pixel(2, 1), &image::Rgb([10, 20, 30]));
    }

    #[test]
    fn test_decode_image_garbage() {
        let err = decode_image(b"definitely not an image").unwrap_err();
        assert!(matches!(err, ExtractorError::Decode(_)));
    }

    #[test]
    fn test_onnx_extractor_missing_models() {
        let dir = tempfile::tempdir().unwrap();
        let err = OnnxExtractor::load(dir.path()).err().unwrap();
        assert!(matches!(
            err,
            ExtractorError::Detector(DetectorError::ModelNotFound(_))
        ));
    }
}
