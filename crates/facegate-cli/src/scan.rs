//! Periodic capture-and-submit loop.
//!
//! One cycle grabs a frame, encodes it as JPEG and submits it, then waits
//! `interval` from the end of the cycle. There is never more than one
//! submission in flight and the camera is only touched from one cycle at a
//! time. Cancellation is checked before each capture and before sleeping; a
//! submission that has started is allowed to finish.

use crate::client::{MatchOutcome, MatchSubmitter};
use facegate_hw::{CameraError, FrameError, FrameSource, SharedCamera, DEFAULT_JPEG_QUALITY};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Capturing,
    Sending,
    Scheduled,
    ShuttingDown,
    Stopped,
}

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("camera: {0}")]
    Camera(#[from] CameraError),
    #[error("encode: {0}")]
    Encode(#[from] FrameError),
    #[error("capture task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Copy)]
pub struct ScanConfig {
    pub interval: Duration,
    pub jpeg_quality: u8,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

/// Counters reported when the scheduler stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub cycles: u64,
    pub sent: u64,
    pub matches: u64,
    pub capture_failures: u64,
    pub submit_failures: u64,
}

pub struct CaptureScheduler<S, M> {
    camera: SharedCamera<S>,
    submitter: M,
    config: ScanConfig,
    state: watch::Sender<SchedulerState>,
}

impl<S, M> CaptureScheduler<S, M>
where
    S: FrameSource + 'static,
    M: MatchSubmitter,
{
    pub fn new(camera: SharedCamera<S>, submitter: M, config: ScanConfig) -> Self {
        let (state, _) = watch::channel(SchedulerState::Idle);
        Self {
            camera,
            submitter,
            config,
            state,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.state.subscribe()
    }

    /// Run cycles until `shutdown` is cancelled, then release the camera.
    pub async fn run(self, shutdown: CancellationToken) -> ScanSummary {
        let mut summary = ScanSummary::default();
        self.set_state(SchedulerState::Scheduled);
        tracing::info!(interval = ?self.config.interval, "capture scheduler started");

        while !shutdown.is_cancelled() {
            summary.cycles += 1;
            self.cycle(&mut summary).await;

            if shutdown.is_cancelled() {
                break;
            }
            self.set_state(SchedulerState::Scheduled);
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {}
                _ = shutdown.cancelled() => break,
            }
        }

        self.set_state(SchedulerState::ShuttingDown);
        let camera = self.camera.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || camera.release()).await {
            tracing::error!(error = %e, "camera release task failed");
        }
        self.set_state(SchedulerState::Stopped);

        tracing::info!(
            cycles = summary.cycles,
            sent = summary.sent,
            matches = summary.matches,
            capture_failures = summary.capture_failures,
            submit_failures = summary.submit_failures,
            "capture scheduler stopped"
        );
        summary
    }

    async fn cycle(&self, summary: &mut ScanSummary) {
        self.set_state(SchedulerState::Capturing);
        let jpeg = match self.capture().await {
            Ok(jpeg) => jpeg,
            Err(e) => {
                summary.capture_failures += 1;
                tracing::warn!(error = %e, "capture failed, skipping submission");
                return;
            }
        };

        self.set_state(SchedulerState::Sending);
        summary.sent += 1;
        match self.submitter.submit(jpeg).await {
            Ok(MatchOutcome::Matched { user_id, email }) => {
                summary.matches += 1;
                tracing::info!(%user_id, email = ?email, "face matched");
            }
            Ok(MatchOutcome::NoMatch { reason }) => {
                tracing::info!(reason = ?reason, "no match");
            }
            Err(e) => {
                summary.submit_failures += 1;
                if e.is_timeout() {
                    tracing::error!(error = %e, "submission timed out");
                } else {
                    tracing::error!(error = %e, "submission failed");
                }
            }
        }
    }

    async fn capture(&self) -> Result<Vec<u8>, CaptureError> {
        let camera = self.camera.clone();
        let quality = self.config.jpeg_quality;
        tokio::task::spawn_blocking(move || {
            let frame = camera.capture()?;
            Ok(frame.encode_jpeg(quality)?)
        })
        .await?
    }

    fn set_state(&self, state: SchedulerState) {
        tracing::trace!(?state, "scheduler state");
        self.state.send_replace(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::SubmitError;
    use facegate_hw::Frame;
    use std::future::Future;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    const TICK: Duration = Duration::from_millis(10);

    /// Yields a frame per grab, or fails on the listed grab numbers.
    struct ScriptedSource {
        grabs: Arc<AtomicUsize>,
        fail_on: Vec<usize>,
    }

    impl FrameSource for ScriptedSource {
        fn grab(&mut self) -> Result<Frame, CameraError> {
            let n = self.grabs.fetch_add(1, Ordering::SeqCst);
            if self.fail_on.contains(&n) {
                return Err(CameraError::CaptureFailed("scripted".into()));
            }
            Ok(Frame::from_rgb(vec![128; 2 * 2 * 3], 2, 2, n as u32)?)
        }
    }

    #[derive(Clone, Default)]
    struct RecordingSubmitter {
        submitted: Arc<Mutex<Vec<Vec<u8>>>>,
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
        delay: Duration,
        outcomes: Arc<Mutex<Vec<Result<MatchOutcome, SubmitError>>>>,
    }

    impl RecordingSubmitter {
        fn count(&self) -> usize {
            self.submitted.lock().unwrap().len()
        }
    }

    impl MatchSubmitter for RecordingSubmitter {
        fn submit(&self, jpeg: Vec<u8>) -> impl Future<Output = Result<MatchOutcome, SubmitError>> + Send {
            let this = self.clone();
            async move {
                let now = this.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                this.max_in_flight.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(this.delay).await;
                this.submitted.lock().unwrap().push(jpeg);
                this.in_flight.fetch_sub(1, Ordering::SeqCst);

                let mut outcomes = this.outcomes.lock().unwrap();
                if outcomes.is_empty() {
                    Ok(MatchOutcome::NoMatch { reason: None })
                } else {
                    outcomes.remove(0)
                }
            }
        }
    }

    fn scheduler(
        fail_on: Vec<usize>,
        submitter: RecordingSubmitter,
    ) -> (CaptureScheduler<ScriptedSource, RecordingSubmitter>, SharedCamera<ScriptedSource>, Arc<AtomicUsize>) {
        let grabs = Arc::new(AtomicUsize::new(0));
        let camera = SharedCamera::new(ScriptedSource {
            grabs: Arc::clone(&grabs),
            fail_on,
        });
        let config = ScanConfig {
            interval: TICK,
            jpeg_quality: 80,
        };
        (CaptureScheduler::new(camera.clone(), submitter, config), camera, grabs)
    }

    #[tokio::test]
    async fn test_cancelled_before_start_never_captures() {
        let (scheduler, camera, grabs) = scheduler(vec![], RecordingSubmitter::default());
        let state = scheduler.subscribe();
        let token = CancellationToken::new();
        token.cancel();

        let summary = scheduler.run(token).await;
        assert_eq!(summary, ScanSummary::default());
        assert_eq!(grabs.load(Ordering::SeqCst), 0);
        assert!(camera.is_released());
        assert_eq!(*state.borrow(), SchedulerState::Stopped);
    }

    #[tokio::test]
    async fn test_runs_cycles_until_cancelled() {
        let submitter = RecordingSubmitter::default();
        let (scheduler, camera, _) = scheduler(vec![], submitter.clone());
        let token = CancellationToken::new();

        let handle = tokio::spawn(scheduler.run(token.clone()));
        tokio::time::sleep(TICK * 8).await;
        token.cancel();
        let summary = handle.await.unwrap();

        assert!(summary.cycles >= 2, "{summary:?}");
        assert_eq!(summary.sent as usize, submitter.count());
        assert!(camera.is_released());

        // Submitted payloads are JPEG.
        let first = submitter.submitted.lock().unwrap()[0].clone();
        assert_eq!(&first[..2], &[0xFF, 0xD8]);
    }

    #[tokio::test]
    async fn test_capture_failure_skips_submission() {
        let submitter = RecordingSubmitter::default();
        let (scheduler, _, grabs) = scheduler(vec![0], submitter.clone());
        let token = CancellationToken::new();

        let handle = tokio::spawn(scheduler.run(token.clone()));
        while grabs.load(Ordering::SeqCst) < 3 {
            tokio::time::sleep(TICK).await;
        }
        token.cancel();
        let summary = handle.await.unwrap();

        assert_eq!(summary.capture_failures, 1);
        assert_eq!(summary.sent, summary.cycles - 1);
        assert_eq!(submitter.count() as u64, summary.sent);
    }

    #[tokio::test]
    async fn test_submit_failure_does_not_stop_loop() {
        let submitter = RecordingSubmitter {
            outcomes: Arc::new(Mutex::new(vec![
                Err(SubmitError::UnexpectedStatus {
                    status: 500,
                    body: String::new(),
                }),
                Ok(MatchOutcome::Matched {
                    user_id: serde_json::json!(3),
                    email: None,
                }),
            ])),
            ..Default::default()
        };
        let (scheduler, _, _) = scheduler(vec![], submitter.clone());
        let token = CancellationToken::new();

        let handle = tokio::spawn(scheduler.run(token.clone()));
        while submitter.count() < 3 {
            tokio::time::sleep(TICK).await;
        }
        token.cancel();
        let summary = handle.await.unwrap();

        assert_eq!(summary.submit_failures, 1);
        assert_eq!(summary.matches, 1);
        assert!(summary.sent >= 3);
    }

    #[tokio::test]
    async fn test_in_flight_submission_completes_after_cancel() {
        let submitter = RecordingSubmitter {
            delay: Duration::from_millis(100),
            ..Default::default()
        };
        let (scheduler, camera, _) = scheduler(vec![], submitter.clone());
        let mut state = scheduler.subscribe();
        let token = CancellationToken::new();

        let handle = tokio::spawn(scheduler.run(token.clone()));
        state
            .wait_for(|s| *s == SchedulerState::Sending)
            .await
            .unwrap();
        token.cancel();
        let summary = handle.await.unwrap();

        assert_eq!(summary.cycles, 1);
        assert_eq!(submitter.count(), 1);
        assert_eq!(submitter.max_in_flight.load(Ordering::SeqCst), 1);
        assert!(camera.is_released());
    }

    #[tokio::test]
    async fn test_slow_submissions_never_overlap() {
        // Each submission takes several intervals; the next cycle must still wait for it.
        let submitter = RecordingSubmitter {
            delay: TICK * 5,
            ..Default::default()
        };
        let (scheduler, _, _) = scheduler(vec![], submitter.clone());
        let token = CancellationToken::new();

        let handle = tokio::spawn(scheduler.run(token.clone()));
        while submitter.count() < 4 {
            tokio::time::sleep(TICK).await;
        }
        token.cancel();
        let summary = handle.await.unwrap();

        assert!(summary.sent >= 4, "{summary:?}");
        assert_eq!(submitter.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(submitter.in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_sleep_is_interrupted_by_cancel() {
        let submitter = RecordingSubmitter::default();
        let grabs = Arc::new(AtomicUsize::new(0));
        let camera = SharedCamera::new(ScriptedSource {
            grabs: Arc::clone(&grabs),
            fail_on: vec![],
        });
        let config = ScanConfig {
            interval: Duration::from_secs(60),
            jpeg_quality: 80,
        };
        let scheduler = CaptureScheduler::new(camera, submitter, config);
        let mut state = scheduler.subscribe();
        let token = CancellationToken::new();

        let handle = tokio::spawn(scheduler.run(token.clone()));
        // The first cycle runs immediately; wait until it is parked in the sleep.
        while grabs.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(TICK).await;
        }
        state
            .wait_for(|s| *s == SchedulerState::Scheduled)
            .await
            .unwrap();
        token.cancel();

        let summary = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("scheduler did not stop")
            .unwrap();
        assert_eq!(summary.cycles, 1);
    }

    #[tokio::test]
    async fn test_release_by_signal_path_is_a_capture_failure() {
        let submitter = RecordingSubmitter::default();
        let (scheduler, camera, _) = scheduler(vec![], submitter.clone());
        assert!(camera.release());
        let token = CancellationToken::new();

        let handle = tokio::spawn(scheduler.run(token.clone()));
        tokio::time::sleep(TICK * 4).await;
        token.cancel();
        let summary = handle.await.unwrap();

        assert!(summary.capture_failures >= 1);
        assert_eq!(summary.sent, 0);
        assert_eq!(submitter.count(), 0);
        // The scheduler's own release is a no-op.
        assert!(!camera.release());
    }
}
