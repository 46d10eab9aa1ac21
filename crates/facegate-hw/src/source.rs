//! Exclusive, releasable ownership of a frame source.
//!
//! [`SharedCamera`] lets a capture loop and a shutdown path hold the same
//! camera. Release waits for any in-flight grab to finish, and releasing
//! twice is a no-op.

use crate::camera::CameraError;
use crate::frame::Frame;
use std::sync::{Arc, Mutex, MutexGuard};

/// Anything that can produce camera frames.
pub trait FrameSource: Send {
    fn grab(&mut self) -> Result<Frame, CameraError>;
}

/// Clone-safe handle to a frame source that can be released exactly once.
pub struct SharedCamera<S> {
    inner: Arc<Mutex<Option<S>>>,
}

impl<S> Clone for SharedCamera<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: FrameSource> SharedCamera<S> {
    pub fn new(source: S) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(source))),
        }
    }

    /// Grab one frame. Blocks while another grab or a release is running.
    pub fn capture(&self) -> Result<Frame, CameraError> {
        match self.lock().as_mut() {
            Some(source) => source.grab(),
            None => Err(CameraError::Released),
        }
    }

    /// Drop the underlying source. Returns `true` only for the call that
    /// actually released it.
    pub fn release(&self) -> bool {
        let released = self.lock().take().is_some();
        if released {
            tracing::info!("camera released");
        } else {
            tracing::debug!("camera already released");
        }
        released
    }

    pub fn is_released(&self) -> bool {
        self.lock().is_none()
    }

    // A panic inside `grab` poisons the mutex; the Option is still coherent.
    fn lock(&self) -> MutexGuard<'_, Option<S>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
