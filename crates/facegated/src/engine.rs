use facegate_core::{
    decode_image, EmbeddingExtractor, EnrollError, Enrollment, ExtractorError, FaceMatcher,
    Gallery, MatchConfig, MatchDecision, MatchError,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("image error: {0}")]
    Image(#[from] ExtractorError),
    #[error("enrollment error: {0}")]
    Enroll(#[from] EnrollError),
    #[error("match error: {0}")]
    Match(#[from] MatchError),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Extractor that can be moved onto the engine thread.
pub type BoxedExtractor = Box<dyn EmbeddingExtractor + Send>;

/// Messages sent from HTTP handlers to the engine thread.
enum EngineRequest {
    Enroll {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<Enrollment, EngineError>>,
    },
    Match {
        image: Vec<u8>,
        gallery: Arc<Gallery>,
        reply: oneshot::Sender<Result<MatchDecision, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    config: MatchConfig,
}

impl EngineHandle {
    pub fn match_config(&self) -> &MatchConfig {
        &self.config
    }

    /// Request enrollment of one encoded reference image.
    pub async fn enroll(&self, image: Vec<u8>) -> Result<Enrollment, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Enroll {
                image,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Request a match of one encoded live image against a gallery snapshot.
    pub async fn match_image(
        &self,
        image: Vec<u8>,
        gallery: Arc<Gallery>,
    ) -> Result<MatchDecision, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Match {
                image,
                gallery,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The extractor is owned by that thread; requests are served one at a time.
pub fn spawn_engine(extractor: BoxedExtractor, config: MatchConfig) -> EngineHandle {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(16);

    std::thread::Builder::new()
        .name("facegate-engine".into())
        .spawn(move || {
            let mut extractor = extractor;
            let matcher = FaceMatcher::new(config);
            tracing::info!("engine thread started");

            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Enroll { image, reply } => {
                        let _ = reply.send(run_enroll(&mut extractor, &image));
                    }
                    EngineRequest::Match {
                        image,
                        gallery,
                        reply,
                    } => {
                        let _ = reply.send(run_match(&mut extractor, &matcher, &image, &gallery));
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .expect("failed to spawn engine thread");

    EngineHandle { tx, config }
}

fn run_enroll(extractor: &mut BoxedExtractor, image: &[u8]) -> Result<Enrollment, EngineError> {
    let image = decode_image(image)?;
    tracing::debug!(width = image.width(), height = image.height(), "enroll: image decoded");
    Ok(facegate_core::enroll(extractor, &image)?)
}

fn run_match(
    extractor: &mut BoxedExtractor,
    matcher: &FaceMatcher,
    image: &[u8],
    gallery: &Gallery,
) -> Result<MatchDecision, EngineError> {
    let image = decode_image(image)?;
    let decision = matcher.match_image(extractor, &image, gallery)?;
    tracing::info!(
        gallery = gallery.len(),
        decision = ?decision,
        "match: decision made"
    );
    Ok(decision)
}
