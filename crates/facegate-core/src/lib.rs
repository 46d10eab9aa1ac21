//! facegate-core: face enrollment and gallery matching.
//!
//! An [`EmbeddingExtractor`] turns an image into face detections with
//! embeddings. [`enroll`] keeps the largest face of a reference image;
//! [`FaceMatcher`] finds the nearest gallery embedding and applies a
//! distance threshold. [`OnnxExtractor`] provides SCRFD detection and
//! ArcFace recognition via ONNX Runtime.

pub mod detector;
pub mod enrollment;
pub mod extractor;
pub mod gallery;
pub mod matcher;
pub mod recognizer;
pub mod types;

pub use enrollment::{enroll, EnrollError, Enrollment};
pub use extractor::{
    decode_image, default_model_dir, load_image, EmbeddingExtractor, ExtractorError, OnnxExtractor,
};
pub use gallery::{Gallery, GalleryError, GalleryRecord};
pub use matcher::{
    EuclideanMatcher, FaceMatcher, MatchConfig, MatchError, Matcher, Nearest, ProbeSelection,
    DEFAULT_DISTANCE_THRESHOLD,
};
pub use types::{BoundingBox, Detection, Embedding, Identity, MatchDecision};
