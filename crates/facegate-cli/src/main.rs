use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facegate_core::{
    enroll, load_image, EnrollError, FaceMatcher, Gallery, MatchConfig, OnnxExtractor,
    ProbeSelection, DEFAULT_DISTANCE_THRESHOLD,
};
use facegate_hw::{Camera, Resolution, SharedCamera, DEFAULT_JPEG_QUALITY, DEFAULT_WARMUP_FRAMES};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

mod client;
mod scan;

use client::HttpSubmitter;
use scan::{CaptureScheduler, ScanConfig};

#[derive(Parser)]
#[command(name = "facegate", version, about = "Face enrollment, matching and entry scanning")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the embedding of the largest face in a reference image as JSON
    Enroll {
        /// Reference image
        image: PathBuf,
        /// Directory containing det_10g.onnx and w600k_r50.onnx
        #[arg(long, env = "FACEGATE_MODEL_DIR")]
        model_dir: Option<PathBuf>,
    },
    /// Match a live image against a gallery file and print the identity
    Match {
        /// Live image
        image: PathBuf,
        /// Gallery JSON file
        gallery: PathBuf,
        #[arg(long, env = "FACEGATE_MODEL_DIR")]
        model_dir: Option<PathBuf>,
        /// Maximum distance for a match (lower is stricter)
        #[arg(long, env = "FACEGATE_DISTANCE_THRESHOLD", default_value_t = DEFAULT_DISTANCE_THRESHOLD)]
        threshold: f64,
        /// Which face to use when several are found: first or largest
        #[arg(long, env = "FACEGATE_PROBE_SELECTION", default_value_t = ProbeSelection::First)]
        probe_selection: ProbeSelection,
        /// Print the full decision as JSON
        #[arg(long)]
        json: bool,
    },
    /// Periodically capture frames and submit them to the match service
    Scan {
        /// Match endpoint
        #[arg(long, env = "FACEGATE_URL", default_value = "http://localhost:4000/match")]
        url: String,
        /// Seconds between the end of one cycle and the start of the next
        #[arg(long, env = "FACEGATE_INTERVAL_SECS", default_value_t = 5)]
        interval: u64,
        /// Camera device
        #[arg(long, env = "FACEGATE_DEVICE", default_value = "/dev/video0")]
        device: String,
        /// Requested capture width; the driver may choose the nearest
        #[arg(long, default_value_t = 640)]
        width: u32,
        #[arg(long, default_value_t = 480)]
        height: u32,
        /// Per-submission timeout in seconds
        #[arg(long, env = "FACEGATE_SUBMIT_TIMEOUT_SECS", default_value_t = 10)]
        timeout: u64,
        #[arg(long, default_value_t = DEFAULT_JPEG_QUALITY)]
        jpeg_quality: u8,
        /// Frames dropped before each kept frame while exposure settles
        #[arg(long, env = "FACEGATE_WARMUP_FRAMES", default_value_t = DEFAULT_WARMUP_FRAMES)]
        warmup_frames: usize,
    },
    /// List V4L2 capture devices
    Devices,
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries command output; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Enroll { image, model_dir } => {
            let mut extractor = load_extractor(model_dir)?;
            let image = load_image(&image)
                .with_context(|| format!("failed to read {}", image.display()))?;
            match enroll(&mut extractor, &image) {
                Ok(enrollment) => {
                    println!("{}", serde_json::to_string(&enrollment.embedding)?);
                }
                Err(EnrollError::NoFaceDetected) => {
                    tracing::warn!("no face detected");
                }
                Err(e) => return Err(e).context("enrollment failed"),
            }
        }
        Commands::Match {
            image,
            gallery,
            model_dir,
            threshold,
            probe_selection,
            json,
        } => {
            anyhow::ensure!(
                threshold.is_finite() && threshold >= 0.0,
                "threshold must be a non-negative number"
            );
            let gallery = Gallery::load(&gallery).context("failed to load gallery")?;
            let mut extractor = load_extractor(model_dir)?;
            let image = load_image(&image)
                .with_context(|| format!("failed to read {}", image.display()))?;

            let matcher = FaceMatcher::new(MatchConfig {
                threshold,
                probe_selection,
            });
            let decision = matcher
                .match_image(&mut extractor, &image, &gallery)
                .context("matching failed")?;

            if json {
                println!("{}", serde_json::to_string(&decision)?);
            } else {
                let identity = decision.identity().map(ToString::to_string).unwrap_or_default();
                println!("{identity}");
            }
        }
        Commands::Scan {
            url,
            interval,
            device,
            width,
            height,
            timeout,
            jpeg_quality,
            warmup_frames,
        } => {
            let resolution = Resolution { width, height };
            let camera = tokio::task::spawn_blocking(move || Camera::open_with(&device, resolution))
                .await?
                .context("failed to open camera")?
                .with_warmup_frames(warmup_frames);
            tracing::info!(
                device = %camera.device_path,
                width = camera.width,
                height = camera.height,
                format = ?camera.pixel_format(),
                warmup_frames = camera.warmup_frames(),
                "camera opened"
            );
            let camera = SharedCamera::new(camera);
            let submitter = HttpSubmitter::new(url, Duration::from_secs(timeout))
                .context("failed to build HTTP client")?;
            tracing::info!(url = submitter.url(), "submitting to match service");

            let shutdown = CancellationToken::new();
            tokio::spawn({
                let shutdown = shutdown.clone();
                let camera = camera.clone();
                async move {
                    shutdown_signal().await;
                    tracing::info!("shutdown requested");
                    shutdown.cancel();
                    // Waits for an in-flight grab to finish.
                    let _ = tokio::task::spawn_blocking(move || camera.release()).await;
                }
            });

            let config = ScanConfig {
                interval: Duration::from_secs(interval),
                jpeg_quality,
            };
            let summary = CaptureScheduler::new(camera, submitter, config)
                .run(shutdown)
                .await;
            eprintln!(
                "{} cycles, {} sent, {} matched, {} capture failures, {} submit failures",
                summary.cycles,
                summary.sent,
                summary.matches,
                summary.capture_failures,
                summary.submit_failures
            );
        }
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for dev in devices {
                println!("{}  {} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
            }
        }
    }

    Ok(())
}

fn load_extractor(model_dir: Option<PathBuf>) -> Result<OnnxExtractor> {
    let model_dir = model_dir.unwrap_or_else(facegate_core::default_model_dir);
    OnnxExtractor::load(&model_dir)
        .with_context(|| format!("failed to load models from {}", model_dir.display()))
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
