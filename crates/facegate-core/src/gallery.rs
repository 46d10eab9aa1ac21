//! Gallery store: a read-only snapshot of enrolled (identity, embedding) records.
//!
//! Persisted as a flat JSON array:
//!
//! ```text
//! [{"user_id": 1, "embedding": [0.01, -0.2, ...], "email": "a@example.com"}, ...]
//! ```
//!
//! `identity` is accepted as an alias for `user_id`. Loading validates every
//! record and fails on the first malformed one instead of skipping it.

use crate::types::{Embedding, Identity};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("failed to read gallery {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("gallery is not a JSON array of records: {0}")]
    Format(#[from] serde_json::Error),
    #[error("malformed gallery record at index {index}: {reason}")]
    MalformedRecord { index: usize, reason: String },
}

/// One enrolled face.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GalleryRecord {
    #[serde(rename = "user_id", alias = "identity")]
    pub identity: Identity,
    pub embedding: Embedding,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl GalleryRecord {
    pub fn new(identity: impl Into<Identity>, embedding: Embedding) -> Self {
        Self {
            identity: identity.into(),
            embedding,
            email: None,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }
}

/// Index-aligned identities and embeddings.
///
/// `identities[i]` owns `embeddings[i]`; both always have the same length and
/// every embedding has the same dimensionality.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Gallery {
    identities: Vec<Identity>,
    embeddings: Vec<Embedding>,
    emails: Vec<Option<String>>,
}

impl Gallery {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a gallery from records, validating dimensionality and values.
    pub fn from_records(records: Vec<GalleryRecord>) -> Result<Self, GalleryError> {
        let mut gallery = Self {
            identities: Vec::with_capacity(records.len()),
            embeddings: Vec::with_capacity(records.len()),
            emails: Vec::with_capacity(records.len()),
        };

        for (index, record) in records.into_iter().enumerate() {
            validate_embedding(index, &record.embedding, gallery.dim())?;
            gallery.identities.push(record.identity);
            gallery.embeddings.push(record.embedding);
            gallery.emails.push(record.email);
        }

        Ok(gallery)
    }

    /// Parse the persisted JSON array format.
    pub fn from_json_slice(bytes: &[u8]) -> Result<Self, GalleryError> {
        let raw: Vec<Value> = serde_json::from_slice(bytes)?;
        let records = raw
            .into_iter()
            .enumerate()
            .map(|(index, value)| parse_record(index, value))
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_records(records)
    }

    /// Load a gallery snapshot from a JSON file.
    pub fn load(path: &Path) -> Result<Self, GalleryError> {
        let bytes = std::fs::read(path).map_err(|source| GalleryError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let gallery = Self::from_json_slice(&bytes)?;
        tracing::debug!(
            path = %path.display(),
            records = gallery.len(),
            dim = ?gallery.dim(),
            "gallery loaded"
        );
        Ok(gallery)
    }

    /// Serialize to the persisted JSON array format.
    pub fn to_json_vec(&self) -> Result<Vec<u8>, GalleryError> {
        Ok(serde_json::to_vec(&self.records().collect::<Vec<_>>())?)
    }

    /// Write the gallery to `path`, replacing any existing file atomically.
    pub fn save(&self, path: &Path) -> Result<(), GalleryError> {
        let io_err = |source| GalleryError::Io {
            path: path.display().to_string(),
            source,
        };
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, self.to_json_vec()?).map_err(io_err)?;
        std::fs::rename(&tmp, path).map_err(io_err)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// Shared embedding dimensionality, `None` for an empty gallery.
    pub fn dim(&self) -> Option<usize> {
        self.embeddings.first().map(Embedding::dim)
    }

    pub fn identities(&self) -> &[Identity] {
        &self.identities
    }

    pub fn embeddings(&self) -> &[Embedding] {
        &self.embeddings
    }

    pub fn email(&self, index: usize) -> Option<&str> {
        self.emails.get(index).and_then(|e| e.as_deref())
    }

    /// Re-assemble records in gallery order.
    pub fn records(&self) -> impl Iterator<Item = GalleryRecord> + '_ {
        self.identities
            .iter()
            .zip(&self.embeddings)
            .zip(&self.emails)
            .map(|((identity, embedding), email)| GalleryRecord {
                identity: identity.clone(),
                embedding: embedding.clone(),
                email: email.clone(),
            })
    }
}

fn parse_record(index: usize, value: Value) -> Result<GalleryRecord, GalleryError> {
    let malformed = |reason: String| GalleryError::MalformedRecord { index, reason };

    let Value::Object(obj) = &value else {
        return Err(malformed(format!("expected an object, got {value}")));
    };
    if !obj.contains_key("user_id") && !obj.contains_key("identity") {
        return Err(malformed("missing `user_id`/`identity`".into()));
    }
    match obj.get("embedding") {
        None => return Err(malformed("missing `embedding`".into())),
        Some(Value::Array(_)) => {}
        Some(other) => return Err(malformed(format!("`embedding` must be an array, got {other}"))),
    }

    serde_json::from_value(value).map_err(|e| malformed(e.to_string()))
}

fn validate_embedding(index: usize, embedding: &Embedding, dim: Option<usize>) -> Result<(), GalleryError> {
    let malformed = |reason: String| GalleryError::MalformedRecord { index, reason };

    if embedding.dim() == 0 {
        return Err(malformed("embedding is empty".into()));
    }
    if let Some(expected) = dim {
        if embedding.dim() != expected {
            return Err(malformed(format!(
                "embedding has {} dimensions, gallery has {expected}",
                embedding.dim()
            )));
        }
    }
    if let Some(pos) = embedding.values().iter().position(|v| !v.is_finite()) {
        return Err(malformed(format!("embedding value {pos} is not finite")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn record(id: i64, values: &[f64]) -> GalleryRecord {
        GalleryRecord::new(id, Embedding::new(values.to_vec()))
    }

    #[test]
    fn test_from_json_parallel_sequences() {
        let json = br#"[
            {"user_id": 7, "embedding": [0.1, 0.2], "email": "a@example.com"},
            {"identity": "bob", "embedding": [0.3, 0.4]}
        ]"#;
        let gallery = Gallery::from_json_slice(json).unwrap();

        assert_eq!(gallery.len(), 2);
        assert_eq!(gallery.identities().len(), gallery.embeddings().len());
        assert_eq!(gallery.identities()[0], Identity::Id(7));
        assert_eq!(gallery.identities()[1], Identity::Name("bob".into()));
        assert_eq!(gallery.embeddings()[1].values(), &[0.3, 0.4]);
        assert_eq!(gallery.email(0), Some("a@example.com"));
        assert_eq!(gallery.email(1), None);
        assert_eq!(gallery.dim(), Some(2));
    }

    #[test]
    fn test_empty_gallery_is_valid() {
        let gallery = Gallery::from_json_slice(b"[]").unwrap();
        assert!(gallery.is_empty());
        assert_eq!(gallery.dim(), None);
    }

    #[rstest]
    #[case::missing_identity(r#"[{"embedding": [0.1]}]"#, 0)]
    #[case::missing_embedding(r#"[{"user_id": 1, "embedding": [0.1]}, {"user_id": 2}]"#, 1)]
    #[case::embedding_not_array(r#"[{"user_id": 1, "embedding": "0.1,0.2"}]"#, 0)]
    #[case::non_numeric_value(r#"[{"user_id": 1, "embedding": [0.1, "x"]}]"#, 0)]
    #[case::empty_embedding(r#"[{"user_id": 1, "embedding": []}]"#, 0)]
    #[case::not_an_object(r#"[{"user_id": 1, "embedding": [0.1]}, 42]"#, 1)]
    #[case::bad_identity(r#"[{"user_id": [1], "embedding": [0.1]}]"#, 0)]
    #[case::dimension_mismatch(
        r#"[{"user_id": 1, "embedding": [0.1, 0.2]}, {"user_id": 2, "embedding": [0.1]}]"#,
        1
    )]
    fn test_malformed_records_fail_fast(#[case] json: &str, #[case] bad_index: usize) {
        match Gallery::from_json_slice(json.as_bytes()) {
            Err(GalleryError::MalformedRecord { index, .. }) => assert_eq!(index, bad_index),
            other => panic!("expected MalformedRecord at {bad_index}, got {other:?}"),
        }
    }

    #[test]
    fn test_not_an_array() {
        assert!(matches!(
            Gallery::from_json_slice(br#"{"user_id": 1}"#),
            Err(GalleryError::Format(_))
        ));
    }

    #[test]
    fn test_non_finite_rejected() {
        let err = Gallery::from_records(vec![record(1, &[0.5, f64::NAN])]).unwrap_err();
        assert!(matches!(err, GalleryError::MalformedRecord { index: 0, .. }));
    }

    #[test]
    fn test_save_and_load_roundtrip_is_exact() {
        let values: Vec<f64> = (0..128).map(|i| ((i as f64) * 0.7311).sin() / 3.0).collect();
        let gallery = Gallery::from_records(vec![
            record(1, &values).with_email("one@example.com"),
            record(2, &vec![0.1 + 0.2; 128]),
        ])
        .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gallery.json");
        gallery.save(&path).unwrap();
        let reloaded = Gallery::load(&path).unwrap();

        assert_eq!(reloaded, gallery);
        assert_eq!(reloaded.embeddings()[0].values(), values.as_slice());
    }

    #[test]
    fn test_load_missing_file() {
        let err = Gallery::load(Path::new("/nonexistent/gallery.json")).unwrap_err();
        assert!(matches!(err, GalleryError::Io { .. }));
    }
}
