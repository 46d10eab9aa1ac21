//! V4L2 camera capture via the `v4l` crate.
//!
//! The scanner only needs an occasional still, so each capture maps a short
//! stream, drops the first few buffers while exposure and gain settle, keeps
//! the next one and drops the stream again.

use crate::frame::{self, Frame, FrameData, FrameError};
use crate::source::FrameSource;
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::capability::Flags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const STREAM_BUFFERS: u32 = 4;
/// Frames discarded per capture before one is kept.
pub const DEFAULT_WARMUP_FRAMES: usize = 4;
const MAX_PROBED_NODES: u32 = 16;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device busy: {0}")]
    DeviceBusy(String),
    #[error("{0} is not a video capture device")]
    NotCaptureDevice(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("camera already released")]
    Released,
    #[error("frame conversion failed: {0}")]
    Frame(#[from] FrameError),
}

/// A capture device found by [`Camera::list_devices`].
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Pixel layouts the camera can deliver that we know how to turn into JPEG.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Motion-JPEG; buffers are forwarded as-is.
    Mjpeg,
    /// Packed YUYV 4:2:2.
    Yuyv,
    /// 8-bit luma only.
    Grey,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"MJPG" => Some(PixelFormat::Mjpeg),
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"GREY" => Some(PixelFormat::Grey),
            _ => None,
        }
    }

    fn to_frame_data(self, buf: &[u8], width: u32, height: u32) -> Result<FrameData, FrameError> {
        Ok(match self {
            PixelFormat::Mjpeg => FrameData::Jpeg(buf.to_vec()),
            PixelFormat::Yuyv => FrameData::Rgb(frame::yuyv_to_rgb(buf, width, height)?),
            PixelFormat::Grey => FrameData::Rgb(frame::grey_to_rgb(buf, width, height)?),
        })
    }
}

/// Requested capture resolution; the driver may pick the nearest it supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Default for Resolution {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
        }
    }
}

/// An open V4L2 capture device.
pub struct Camera {
    device: Device,
    pub device_path: String,
    pub width: u32,
    pub height: u32,
    pixel_format: PixelFormat,
    warmup_frames: usize,
}

impl Camera {
    /// Open `device_path` (e.g. `/dev/video0`) at the default resolution.
    pub fn open(device_path: &str) -> Result<Self, CameraError> {
        Self::open_with(device_path, Resolution::default())
    }

    pub fn open_with(device_path: &str, resolution: Resolution) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| open_error(device_path, e))?;
        let caps = device
            .query_caps()
            .map_err(|e| CameraError::CaptureFailed(format!("query capabilities: {e}")))?;
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            return Err(CameraError::NotCaptureDevice(device_path.to_string()));
        }

        let (width, height, pixel_format) = negotiate(&device, resolution)?;

        tracing::info!(
            device = device_path,
            card = %caps.card,
            width,
            height,
            format = ?pixel_format,
            "camera ready"
        );

        Ok(Self {
            device,
            device_path: device_path.to_string(),
            width,
            height,
            pixel_format,
            warmup_frames: DEFAULT_WARMUP_FRAMES,
        })
    }

    /// Number of frames to drop from each fresh stream before keeping one.
    pub fn with_warmup_frames(mut self, frames: usize) -> Self {
        self.warmup_frames = frames;
        self
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    pub fn warmup_frames(&self) -> usize {
        self.warmup_frames
    }

    /// Grab one still frame.
    pub fn capture_frame(&self) -> Result<Frame, CameraError> {
        let mut stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| CameraError::CaptureFailed(format!("map stream: {e}")))?;
        discard_frames(self.warmup_frames, || stream.next().map(|_| ()))
            .map_err(|e| CameraError::CaptureFailed(format!("warm-up dequeue: {e}")))?;
        let (buf, meta) = stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("dequeue buffer: {e}")))?;

        // MJPEG buffers are only partly filled; raw formats use the full size.
        let filled = &buf[..(meta.bytesused as usize).min(buf.len())];
        let raw = match self.pixel_format {
            PixelFormat::Mjpeg => filled,
            PixelFormat::Yuyv | PixelFormat::Grey => buf,
        };
        let data = self.pixel_format.to_frame_data(raw, self.width, self.height)?;

        tracing::trace!(sequence = meta.sequence, bytes = filled.len(), "frame captured");
        Ok(Frame {
            data,
            width: self.width,
            height: self.height,
            timestamp: std::time::Instant::now(),
            sequence: meta.sequence,
        })
    }

    /// Probe `/dev/video0` .. `/dev/video15` for capture-capable devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        (0..MAX_PROBED_NODES)
            .map(|i| format!("/dev/video{i}"))
            .filter(|path| Path::new(path).exists())
            .filter_map(|path| {
                let caps = Device::with_path(&path).ok()?.query_caps().ok()?;
                caps.capabilities
                    .contains(Flags::VIDEO_CAPTURE)
                    .then(|| DeviceInfo {
                        path,
                        name: caps.card,
                        driver: caps.driver,
                        bus: caps.bus,
                    })
            })
            .collect()
    }
}

impl FrameSource for Camera {
    fn grab(&mut self) -> Result<Frame, CameraError> {
        self.capture_frame()
    }
}

fn open_error(device_path: &str, e: std::io::Error) -> CameraError {
    if e.raw_os_error() == Some(16) {
        // EBUSY: another process holds the device.
        CameraError::DeviceBusy(device_path.to_string())
    } else {
        CameraError::DeviceNotFound(format!("{device_path}: {e}"))
    }
}

fn discard_frames<E>(count: usize, mut dequeue: impl FnMut() -> Result<(), E>) -> Result<(), E> {
    for _ in 0..count {
        dequeue()?;
    }
    Ok(())
}

/// Ask for MJPEG at `resolution` so frames can be sent without re-encoding,
/// and accept whatever supported format the driver answers with.
fn negotiate(device: &Device, resolution: Resolution) -> Result<(u32, u32, PixelFormat), CameraError> {
    let mut fmt = device
        .format()
        .map_err(|e| CameraError::FormatNegotiationFailed(format!("read format: {e}")))?;
    fmt.fourcc = FourCC::new(b"MJPG");
    fmt.width = resolution.width;
    fmt.height = resolution.height;

    let actual = device
        .set_format(&fmt)
        .map_err(|e| CameraError::FormatNegotiationFailed(format!("set format: {e}")))?;
    let pixel_format = PixelFormat::from_fourcc(actual.fourcc).ok_or_else(|| {
        CameraError::FormatNegotiationFailed(format!("driver offered unsupported {:?}", actual.fourcc))
    })?;

    Ok((actual.width, actual.height, pixel_format))
}
