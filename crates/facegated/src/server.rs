//! HTTP surface of the daemon: registration, matching and status.

use crate::config::Config;
use crate::engine::{EngineError, EngineHandle};
use crate::store::{StoreError, UserStore};
use axum::extract::multipart::MultipartError;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use facegate_core::{EnrollError, ExtractorError, Gallery, GalleryError, Identity, MatchDecision};
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("missing multipart field `{0}`")]
    MissingField(&'static str),
    #[error("invalid multipart body: {0}")]
    Multipart(#[from] MultipartError),
    #[error("no face detected in image")]
    NoFaceDetected,
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("gallery error: {0}")]
    Gallery(#[from] GalleryError),
    #[error("gallery task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingField(_) => StatusCode::BAD_REQUEST,
            // Oversized uploads surface here as 413.
            ApiError::Multipart(e) => e.status(),
            ApiError::Engine(EngineError::Image(ExtractorError::Decode(_))) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::NoFaceDetected => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, "request rejected");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    engine: EngineHandle,
    store: UserStore,
    config: Arc<Config>,
    // Serializes gallery re-exports from concurrent registrations.
    export_lock: Arc<tokio::sync::Mutex<()>>,
}

impl AppState {
    pub fn new(engine: EngineHandle, store: UserStore, config: Config) -> Self {
        Self {
            engine,
            store,
            config: Arc::new(config),
            export_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let body_limit = state.config.max_upload_bytes;
    let timeout = Duration::from_secs(state.config.request_timeout_secs);

    Router::new()
        .route("/register", post(register))
        .route("/match", post(match_face))
        .route("/status", get(status))
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TimeoutLayer::new(timeout))
        .layer(TraceLayer::new_for_http())
}

#[derive(Debug, Default)]
struct Upload {
    image: Option<Vec<u8>>,
    email: Option<String>,
}

async fn read_upload(mut multipart: Multipart) -> Result<Upload, ApiError> {
    let mut upload = Upload::default();
    while let Some(field) = multipart.next_field().await? {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("image") => upload.image = Some(field.bytes().await?.to_vec()),
            Some("email") => upload.email = Some(field.text().await?),
            other => tracing::debug!(field = ?other, "ignoring multipart field"),
        }
    }
    Ok(upload)
}

/// Load the current gallery snapshot; a missing file is an empty gallery.
async fn load_snapshot(path: PathBuf) -> Result<Gallery, ApiError> {
    let gallery = tokio::task::spawn_blocking(move || {
        if path.exists() {
            Gallery::load(&path)
        } else {
            tracing::debug!(path = %path.display(), "no gallery file yet");
            Ok(Gallery::empty())
        }
    })
    .await??;
    Ok(gallery)
}

#[derive(Debug, Serialize)]
struct RegisterResponse {
    user_id: i64,
    biometric_id: Vec<f64>,
}

async fn register(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<RegisterResponse>, ApiError> {
    let upload = read_upload(multipart).await?;
    let image = upload.image.ok_or(ApiError::MissingField("image"))?;
    let email = upload
        .email
        .map(|e| e.trim().to_string())
        .filter(|e| !e.is_empty())
        .ok_or(ApiError::MissingField("email"))?;

    let enrollment = match state.engine.enroll(image).await {
        Ok(enrollment) => enrollment,
        Err(EngineError::Enroll(EnrollError::NoFaceDetected)) => {
            return Err(ApiError::NoFaceDetected)
        }
        Err(e) => return Err(e.into()),
    };

    let user_id = state.store.create_user(&email, &enrollment.embedding).await?;
    {
        let _guard = state.export_lock.lock().await;
        state.store.export_gallery(&state.config.gallery_path).await?;
    }

    tracing::info!(user_id, faces = enrollment.faces_found, "user registered");

    Ok(Json(RegisterResponse {
        user_id,
        biometric_id: enrollment.embedding.values().to_vec(),
    }))
}

#[derive(Debug, Serialize)]
struct MatchResponse {
    user_id: Identity,
    email: Option<String>,
    distance: f64,
}

async fn match_face(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    let upload = read_upload(multipart).await?;
    let image = upload.image.ok_or(ApiError::MissingField("image"))?;

    let gallery = Arc::new(load_snapshot(state.config.gallery_path.clone()).await?);
    let decision = state.engine.match_image(image, Arc::clone(&gallery)).await?;

    let (identity, distance) = match decision {
        MatchDecision::Matched { identity, distance } => (identity, distance),
        MatchDecision::NoMatch => return Ok(not_found("no_match")),
        MatchDecision::NoFaceDetected => return Ok(not_found("no_face_detected")),
    };

    let mut email = gallery
        .identities()
        .iter()
        .position(|i| *i == identity)
        .and_then(|index| gallery.email(index))
        .map(str::to_owned);
    if email.is_none() {
        if let Identity::Id(id) = &identity {
            email = state.store.get_user(*id).await?.map(|user| user.email);
        }
    }

    tracing::info!(user = %identity, distance, "face matched");

    Ok(Json(MatchResponse {
        user_id: identity,
        email,
        distance,
    })
    .into_response())
}

fn not_found(reason: &'static str) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "reason": reason }))).into_response()
}

async fn status(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let gallery = load_snapshot(state.config.gallery_path.clone()).await?;
    let match_config = state.engine.match_config();

    Ok(Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "gallery_size": gallery.len(),
        "distance_threshold": match_config.threshold,
        "probe_selection": match_config.probe_selection,
    })))
}
