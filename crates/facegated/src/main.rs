use anyhow::{Context, Result};
use facegate_core::OnnxExtractor;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod server;
mod store;

use config::Config;
use server::AppState;
use store::UserStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::load().context("failed to load configuration")?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        bind = %config.bind_addr,
        threshold = config.distance_threshold,
        probe_selection = %config.probe_selection,
        "facegated starting"
    );

    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let store = UserStore::open(&config.db_path)
        .await
        .with_context(|| format!("failed to open user database {}", config.db_path.display()))?;

    // The gallery file is derived from the database; rebuild it on every start.
    let exported = store
        .export_gallery(&config.gallery_path)
        .await
        .context("failed to export gallery")?;
    tracing::info!(records = exported, path = %config.gallery_path.display(), "gallery ready");

    let extractor = OnnxExtractor::load(&config.model_dir).with_context(|| {
        format!("failed to load models from {}", config.model_dir.display())
    })?;
    let engine = engine::spawn_engine(Box::new(extractor), config.match_config());

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    let app = server::router(AppState::new(engine, store, config));

    tracing::info!(addr = %listener.local_addr()?, "facegated ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("facegated shutting down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
