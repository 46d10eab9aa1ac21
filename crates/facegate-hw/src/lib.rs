//! facegate-hw: hardware abstraction for camera capture.
//!
//! Provides V4L2-based camera access, conversion of captured frames to
//! JPEG for transport, and a releasable shared camera handle.

pub mod camera;
pub mod frame;
pub mod source;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat, Resolution, DEFAULT_WARMUP_FRAMES};
pub use frame::{Frame, FrameData, FrameError, DEFAULT_JPEG_QUALITY};
pub use source::{FrameSource, SharedCamera};
