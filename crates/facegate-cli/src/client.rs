//! Submission of captured frames to the match service.

use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected response {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },
}

impl SubmitError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, SubmitError::Http(e) if e.is_timeout())
    }
}

/// What the service said about one submitted frame.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    Matched {
        user_id: serde_json::Value,
        email: Option<String>,
    },
    /// 404: no match, or no face. `reason` is set when the service reports it.
    NoMatch { reason: Option<String> },
}

/// Sends one JPEG frame and waits for the decision.
pub trait MatchSubmitter: Send + Sync {
    fn submit(&self, jpeg: Vec<u8>) -> impl Future<Output = Result<MatchOutcome, SubmitError>> + Send;
}

#[derive(Deserialize)]
struct MatchedBody {
    user_id: serde_json::Value,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Deserialize)]
struct NotFoundBody {
    reason: Option<String>,
}

/// `POST`s frames as multipart `image` to the service's `/match` endpoint.
#[derive(Debug, Clone)]
pub struct HttpSubmitter {
    client: reqwest::Client,
    url: String,
}

impl HttpSubmitter {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, SubmitError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn post(&self, jpeg: Vec<u8>) -> Result<MatchOutcome, SubmitError> {
        let part = Part::bytes(jpeg)
            .file_name("image.jpeg")
            .mime_str("image/jpeg")?;
        let form = Form::new().part("image", part);

        let response = self.client.post(&self.url).multipart(form).send().await?;
        let status = response.status();

        match status {
            StatusCode::OK => {
                let body: MatchedBody = response.json().await?;
                Ok(MatchOutcome::Matched {
                    user_id: body.user_id,
                    email: body.email,
                })
            }
            StatusCode::NOT_FOUND => {
                // Older services answer 404 with no body.
                let text = response.text().await?;
                let reason = serde_json::from_str::<NotFoundBody>(&text)
                    .ok()
                    .and_then(|body| body.reason);
                Ok(MatchOutcome::NoMatch { reason })
            }
            _ => Err(SubmitError::UnexpectedStatus {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }
}

impl MatchSubmitter for HttpSubmitter {
    fn submit(&self, jpeg: Vec<u8>) -> impl Future<Output = Result<MatchOutcome, SubmitError>> + Send {
        self.post(jpeg)
    }
}
