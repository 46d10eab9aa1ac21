//! Enrollment: one reference image in, one reference embedding out.

use crate::extractor::{EmbeddingExtractor, ExtractorError};
use crate::types::{BoundingBox, Detection, Embedding};
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("no face detected in enrollment image")]
    NoFaceDetected,
    #[error("extractor error: {0}")]
    Extractor(#[from] ExtractorError),
}

/// Reference embedding chosen from an enrollment image.
///
/// Carries no identity; the caller attaches one to build a gallery record.
#[derive(Debug, Clone, PartialEq)]
pub struct Enrollment {
    pub embedding: Embedding,
    pub region: BoundingBox,
    /// Number of faces the extractor found in the image.
    pub faces_found: usize,
}

/// Pick the detection with the strictly largest area.
///
/// Ties keep the first one seen. Zero-area detections never win, so this
/// returns `None` when no detection has a positive area.
pub fn select_largest(detections: &[Detection]) -> Option<&Detection> {
    let mut best: Option<&Detection> = None;
    let mut best_area = 0.0f32;

    for det in detections {
        let area = det.region.area();
        if area > best_area {
            best_area = area;
            best = Some(det);
        }
    }

    best
}

/// Enroll one reference image: extract, keep the largest face.
pub fn enroll<E>(extractor: &mut E, image: &RgbImage) -> Result<Enrollment, EnrollError>
where
    E: EmbeddingExtractor + ?Sized,
{
    let detections = extractor.extract(image)?;
    if detections.is_empty() {
        tracing::debug!("enroll: no faces detected");
        return Err(EnrollError::NoFaceDetected);
    }

    let chosen = select_largest(&detections).ok_or(EnrollError::NoFaceDetected)?;

    tracing::info!(
        faces = detections.len(),
        area = chosen.region.area(),
        dim = chosen.embedding.dim(),
        "enroll: largest face selected"
    );

    Ok(Enrollment {
        embedding: chosen.embedding.clone(),
        region: chosen.region,
        faces_found: detections.len(),
    })
}
