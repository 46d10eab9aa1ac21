use facegate_core::{MatchConfig, ProbeSelection, DEFAULT_DISTANCE_THRESHOLD};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Daemon configuration: optional TOML file, then `FACEGATE_*` overrides.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Listen address (default: 0.0.0.0:4000).
    pub bind_addr: SocketAddr,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite user database.
    pub db_path: PathBuf,
    /// Exported gallery snapshot read by every match request.
    pub gallery_path: PathBuf,
    /// Maximum Euclidean distance for a positive match.
    pub distance_threshold: f64,
    /// Which face becomes the probe when a live image has several.
    pub probe_selection: ProbeSelection,
    /// Largest accepted upload, in bytes.
    pub max_upload_bytes: usize,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
}

/// Keys accepted in the TOML config file; all optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    bind_addr: Option<SocketAddr>,
    model_dir: Option<PathBuf>,
    db_path: Option<PathBuf>,
    gallery_path: Option<PathBuf>,
    distance_threshold: Option<f64>,
    probe_selection: Option<ProbeSelection>,
    max_upload_bytes: Option<usize>,
    request_timeout_secs: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = data_dir();
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 4000)),
            model_dir: facegate_core::default_model_dir(),
            db_path: data_dir.join("users.db"),
            gallery_path: data_dir.join("gallery.json"),
            distance_threshold: DEFAULT_DISTANCE_THRESHOLD,
            probe_selection: ProbeSelection::default(),
            max_upload_bytes: 10 << 20,
            request_timeout_secs: 30,
        }
    }
}

impl Config {
    /// Load `FACEGATE_CONFIG` (if set) and apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Ok(path) = std::env::var("FACEGATE_CONFIG") {
            config.merge_file(Path::new(&path))?;
        }
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn match_config(&self) -> MatchConfig {
        MatchConfig {
            threshold: self.distance_threshold,
            probe_selection: self.probe_selection,
        }
    }

    fn merge_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let file: FileConfig = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;

        tracing::debug!(path = %path.display(), "loaded config file");

        if let Some(v) = file.bind_addr {
            self.bind_addr = v;
        }
        if let Some(v) = file.model_dir {
            self.model_dir = v;
        }
        if let Some(v) = file.db_path {
            self.db_path = v;
        }
        if let Some(v) = file.gallery_path {
            self.gallery_path = v;
        }
        if let Some(v) = file.distance_threshold {
            self.distance_threshold = v;
        }
        if let Some(v) = file.probe_selection {
            self.probe_selection = v;
        }
        if let Some(v) = file.max_upload_bytes {
            self.max_upload_bytes = v;
        }
        if let Some(v) = file.request_timeout_secs {
            self.request_timeout_secs = v;
        }
        Ok(())
    }

    /// Apply `FACEGATE_*` overrides read through `var`.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(v) = var("FACEGATE_BIND_ADDR") {
            self.bind_addr = parse("FACEGATE_BIND_ADDR", &v)?;
        }
        if let Some(v) = var("FACEGATE_PORT") {
            self.bind_addr.set_port(parse("FACEGATE_PORT", &v)?);
        }
        if let Some(v) = var("FACEGATE_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = var("FACEGATE_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = var("FACEGATE_GALLERY_PATH") {
            self.gallery_path = PathBuf::from(v);
        }
        if let Some(v) = var("FACEGATE_DISTANCE_THRESHOLD") {
            self.distance_threshold = parse("FACEGATE_DISTANCE_THRESHOLD", &v)?;
        }
        if let Some(v) = var("FACEGATE_PROBE_SELECTION") {
            self.probe_selection = parse("FACEGATE_PROBE_SELECTION", &v)?;
        }
        if let Some(v) = var("FACEGATE_MAX_UPLOAD_BYTES") {
            self.max_upload_bytes = parse("FACEGATE_MAX_UPLOAD_BYTES", &v)?;
        }
        if let Some(v) = var("FACEGATE_REQUEST_TIMEOUT_SECS") {
            self.request_timeout_secs = parse("FACEGATE_REQUEST_TIMEOUT_SECS", &v)?;
        }

        if !(self.distance_threshold.is_finite() && self.distance_threshold >= 0.0) {
            return Err(ConfigError::InvalidValue {
                key: "distance_threshold",
                value: self.distance_threshold.to_string(),
            });
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
    })
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facegate")
}
