//! Nearest-neighbor matching of a live face against a gallery snapshot.

use crate::enrollment::select_largest;
use crate::extractor::{EmbeddingExtractor, ExtractorError};
use crate::gallery::Gallery;
use crate::types::{Detection, Embedding, MatchDecision};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Maximum Euclidean distance accepted as a match.
///
/// Lower is stricter: fewer false accepts, more false rejects.
pub const DEFAULT_DISTANCE_THRESHOLD: f64 = 0.6;

#[derive(Error, Debug)]
pub enum MatchError {
    #[error("extractor error: {0}")]
    Extractor(#[from] ExtractorError),
    #[error("probe has {probe} dimensions but gallery embeddings have {gallery}")]
    DimensionMismatch { probe: usize, gallery: usize },
}

/// Which detection becomes the probe when a live image has several faces.
///
/// Enrollment always keeps the largest face; matching historically used the
/// first detection. `First` keeps that behavior, `Largest` aligns the two.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeSelection {
    #[default]
    First,
    Largest,
}

impl ProbeSelection {
    fn pick<'a>(&self, detections: &'a [Detection]) -> Option<&'a Detection> {
        match self {
            ProbeSelection::First => detections.first(),
            // All-degenerate detections still yield a probe; fall back to the first.
            ProbeSelection::Largest => select_largest(detections).or(detections.first()),
        }
    }
}

impl FromStr for ProbeSelection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "first" => Ok(ProbeSelection::First),
            "largest" => Ok(ProbeSelection::Largest),
            other => Err(format!("unknown probe selection `{other}` (expected first or largest)")),
        }
    }
}

impl fmt::Display for ProbeSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProbeSelection::First => "first",
            ProbeSelection::Largest => "largest",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchConfig {
    pub threshold: f64,
    pub probe_selection: ProbeSelection,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_DISTANCE_THRESHOLD,
            probe_selection: ProbeSelection::default(),
        }
    }
}

/// Closest gallery entry to a probe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Nearest {
    pub index: usize,
    pub distance: f64,
}

/// Strategy for finding the closest gallery embedding to a probe.
pub trait Matcher {
    /// `Ok(None)` only for an empty gallery.
    fn nearest(&self, probe: &Embedding, gallery: &Gallery) -> Result<Option<Nearest>, MatchError>;
}

/// Exhaustive Euclidean nearest neighbor.
///
/// Visits every gallery entry; on equal distances the lowest index wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn nearest(&self, probe: &Embedding, gallery: &Gallery) -> Result<Option<Nearest>, MatchError> {
        let Some(dim) = gallery.dim() else {
            return Ok(None);
        };
        if probe.dim() != dim {
            return Err(MatchError::DimensionMismatch {
                probe: probe.dim(),
                gallery: dim,
            });
        }

        let mut best: Option<Nearest> = None;
        for (index, candidate) in gallery.embeddings().iter().enumerate() {
            let distance = probe
                .euclidean_distance(candidate)
                .map_err(|_| MatchError::DimensionMismatch {
                    probe: probe.dim(),
                    gallery: candidate.dim(),
                })?;
            if best.map_or(true, |b| distance < b.distance) {
                best = Some(Nearest { index, distance });
            }
        }
        Ok(best)
    }
}

/// Turns a live image or embedding into a [`MatchDecision`].
#[derive(Debug, Clone, Default)]
pub struct FaceMatcher<M = EuclideanMatcher> {
    matcher: M,
    config: MatchConfig,
}

impl FaceMatcher<EuclideanMatcher> {
    pub fn new(config: MatchConfig) -> Self {
        Self::with_matcher(EuclideanMatcher, config)
    }
}

impl<M: Matcher> FaceMatcher<M> {
    pub fn with_matcher(matcher: M, config: MatchConfig) -> Self {
        Self { matcher, config }
    }

    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    /// Extract faces from `image` and match the probe face against `gallery`.
    pub fn match_image<E>(
        &self,
        extractor: &mut E,
        image: &RgbImage,
        gallery: &Gallery,
    ) -> Result<MatchDecision, MatchError>
    where
        E: EmbeddingExtractor + ?Sized,
    {
        let detections = extractor.extract(image)?;
        let Some(probe) = self.config.probe_selection.pick(&detections) else {
            return Ok(MatchDecision::NoFaceDetected);
        };

        if detections.len() > 1 {
            tracing::warn!(
                faces = detections.len(),
                selection = %self.config.probe_selection,
                "multiple faces in live image"
            );
        }

        self.match_probe(&probe.embedding, gallery)
    }

    /// Match an already-extracted probe embedding.
    pub fn match_probe(&self, probe: &Embedding, gallery: &Gallery) -> Result<MatchDecision, MatchError> {
        let Some(nearest) = self.matcher.nearest(probe, gallery)? else {
            tracing::debug!("gallery is empty");
            return Ok(MatchDecision::NoMatch);
        };

        let decision = if nearest.distance <= self.config.threshold {
            MatchDecision::Matched {
                identity: gallery.identities()[nearest.index].clone(),
                distance: nearest.distance,
            }
        } else {
            MatchDecision::NoMatch
        };

        tracing::debug!(
            index = nearest.index,
            distance = nearest.distance,
            threshold = self.config.threshold,
            matched = decision.is_match(),
            "nearest gallery entry"
        );

        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gallery::GalleryRecord;
    use crate::types::{BoundingBox, Identity};
    use approx::assert_relative_eq;
    use rstest::rstest;

    struct FixedExtractor(Vec<Detection>);

    impl EmbeddingExtractor for FixedExtractor {
        fn extract(&mut self, _image: &RgbImage) -> Result<Vec<Detection>, ExtractorError> {
            Ok(self.0.clone())
        }
    }

    fn emb(values: &[f64]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    fn gallery(entries: &[(i64, &[f64])]) -> Gallery {
        Gallery::from_records(
            entries
                .iter()
                .map(|(id, values)| GalleryRecord::new(*id, emb(values)))
                .collect(),
        )
        .unwrap()
    }

    fn face(side: f32, values: &[f64]) -> Detection {
        Detection {
            region: BoundingBox::from_edges(0.0, side, side, 0.0),
            embedding: emb(values),
        }
    }

    fn matcher() -> FaceMatcher {
        FaceMatcher::new(MatchConfig::default())
    }

    #[test]
    fn test_nearest_is_minimum_over_gallery() {
        let g = gallery(&[
            (1, &[1.0, 1.0, 1.0]),
            (2, &[0.5, 0.0, 0.0]),
            (3, &[0.0, 2.0, 0.0]),
            (4, &[0.2, 0.1, 0.0]),
        ]);
        let probe = emb(&[0.25, 0.05, 0.0]);
        let nearest = EuclideanMatcher.nearest(&probe, &g).unwrap().unwrap();

        assert_eq!(nearest.index, 3);
        for candidate in g.embeddings() {
            assert!(nearest.distance <= probe.euclidean_distance(candidate).unwrap());
        }
    }

    #[test]
    fn test_tie_breaks_to_lowest_index() {
        let g = gallery(&[(10, &[1.0, 0.0]), (20, &[-1.0, 0.0]), (30, &[0.0, 1.0])]);
        let nearest = EuclideanMatcher.nearest(&emb(&[0.0, 0.0]), &g).unwrap().unwrap();
        assert_eq!(nearest.index, 0);
    }

    #[test]
    fn test_empty_gallery_is_no_match() {
        let decision = matcher().match_probe(&emb(&[0.1, 0.2]), &Gallery::empty()).unwrap();
        assert_eq!(decision, MatchDecision::NoMatch);
    }

    #[rstest]
    #[case::exactly_at_threshold(&[0.6], true)]
    #[case::diagonal_at_threshold(&[0.36, 0.48], true)]
    #[case::just_past_threshold(&[0.6000001], false)]
    #[case::identical(&[0.0], true)]
    #[case::far(&[2.0], false)]
    fn test_threshold_is_inclusive(#[case] probe: &[f64], #[case] matched: bool) {
        let zeros = vec![0.0; probe.len()];
        let g = gallery(&[(42, &zeros)]);
        let decision = matcher().match_probe(&emb(probe), &g).unwrap();
        assert_eq!(decision.is_match(), matched, "decision: {decision:?}");
    }

    #[test]
    fn test_matched_carries_identity_and_distance() {
        let g = gallery(&[(1, &[0.0, 0.0]), (2, &[3.0, 4.0])]);
        let decision = matcher().match_probe(&emb(&[3.0, 4.3]), &g).unwrap();
        match decision {
            MatchDecision::Matched { identity, distance } => {
                assert_eq!(identity, Identity::Id(2));
                assert_relative_eq!(distance, 0.3, epsilon = 1e-12);
            }
            other => panic!("expected match, got {other:?}"),
        }
    }

    #[test]
    fn test_custom_threshold_is_stricter() {
        let g = gallery(&[(1, &[0.0])]);
        let strict = FaceMatcher::new(MatchConfig { threshold: 0.4, ..MatchConfig::default() });
        assert_eq!(strict.match_probe(&emb(&[0.5]), &g).unwrap(), MatchDecision::NoMatch);
        assert!(matcher().match_probe(&emb(&[0.5]), &g).unwrap().is_match());
    }

    #[test]
    fn test_no_face_regardless_of_gallery() {
        let image = RgbImage::new(2, 2);
        for g in [Gallery::empty(), gallery(&[(1, &[0.0, 0.0])])] {
            let decision = matcher()
                .match_image(&mut FixedExtractor(vec![]), &image, &g)
                .unwrap();
            assert_eq!(decision, MatchDecision::NoFaceDetected);
        }
    }

    #[test]
    fn test_first_detection_is_probe_by_default() {
        let g = gallery(&[(1, &[0.0, 0.0]), (2, &[5.0, 5.0])]);
        let mut ex = FixedExtractor(vec![face(10.0, &[0.0, 0.1]), face(50.0, &[5.0, 5.0])]);
        let decision = matcher().match_image(&mut ex, &RgbImage::new(2, 2), &g).unwrap();
        assert_eq!(decision.identity(), Some(&Identity::Id(1)));
    }

    #[test]
    fn test_largest_detection_probe_when_configured() {
        let g = gallery(&[(1, &[0.0, 0.0]), (2, &[5.0, 5.0])]);
        let mut ex = FixedExtractor(vec![face(10.0, &[0.0, 0.1]), face(50.0, &[5.0, 5.0])]);
        let m = FaceMatcher::new(MatchConfig {
            probe_selection: ProbeSelection::Largest,
            ..MatchConfig::default()
        });
        let decision = m.match_image(&mut ex, &RgbImage::new(2, 2), &g).unwrap();
        assert_eq!(decision.identity(), Some(&Identity::Id(2)));
    }

    #[test]
    fn test_probe_dimension_mismatch_fails_fast() {
        let g = gallery(&[(1, &[0.0, 0.0, 0.0])]);
        let err = matcher().match_probe(&emb(&[0.0, 0.0]), &g).unwrap_err();
        assert!(matches!(err, MatchError::DimensionMismatch { probe: 2, gallery: 3 }));
    }

    #[test]
    fn test_extractor_fault_propagates() {
        struct Broken;
        impl EmbeddingExtractor for Broken {
            fn extract(&mut self, _image: &RgbImage) -> Result<Vec<Detection>, ExtractorError> {
                Err(ExtractorError::Backend("boom".into()))
            }
        }
        let err = matcher()
            .match_image(&mut Broken, &RgbImage::new(1, 1), &Gallery::empty())
            .unwrap_err();
        assert!(matches!(err, MatchError::Extractor(_)));
    }

    #[rstest]
    #[case("first", ProbeSelection::First)]
    #[case(" Largest ", ProbeSelection::Largest)]
    fn test_probe_selection_from_str(#[case] input: &str, #[case] expected: ProbeSelection) {
        assert_eq!(input.parse::<ProbeSelection>().unwrap(), expected);
    }

    #[test]
    fn test_probe_selection_rejects_unknown() {
        assert!("biggest".parse::<ProbeSelection>().is_err());
    }
}
