//! Frame type, YUYV/GREY to RGB conversion and JPEG encoding.

use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

/// JPEG quality used for frames submitted to the match service.
pub const DEFAULT_JPEG_QUALITY: u8 = 90;

/// Pixel payload of a captured frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FrameData {
    /// Packed 8-bit RGB, `width * height * 3` bytes.
    Rgb(Vec<u8>),
    /// Already-compressed JPEG straight from an MJPG camera.
    Jpeg(Vec<u8>),
}

/// A captured camera frame.
#[derive(Clone, Debug)]
pub struct Frame {
    pub data: FrameData,
    pub width: u32,
    pub height: u32,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
}

impl Frame {
    /// Build an RGB frame, checking the buffer length.
    pub fn from_rgb(rgb: Vec<u8>, width: u32, height: u32, sequence: u32) -> Result<Self, FrameError> {
        let expected = (width * height * 3) as usize;
        if rgb.len() != expected {
            return Err(FrameError::InvalidLength {
                format: "RGB",
                expected,
                actual: rgb.len(),
            });
        }
        Ok(Self {
            data: FrameData::Rgb(rgb),
            width,
            height,
            timestamp: std::time::Instant::now(),
            sequence,
        })
    }

    /// Encode as JPEG; MJPG frames are passed through untouched.
    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>, FrameError> {
        match &self.data {
            FrameData::Jpeg(bytes) => Ok(bytes.clone()),
            FrameData::Rgb(rgb) => {
                let mut out = Vec::new();
                JpegEncoder::new_with_quality(&mut out, quality).encode(
                    rgb,
                    self.width,
                    self.height,
                    ExtendedColorType::Rgb8,
                )?;
                Ok(out)
            }
        }
    }
}

/// Convert packed YUYV (4:2:2) to packed RGB using BT.601 coefficients.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V]; both pixels share U/V.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            format: "YUYV",
            expected,
            actual: yuyv.len(),
        });
    }

    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    for chunk in yuyv[..expected].chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        rgb.extend_from_slice(&ycbcr_to_rgb(y0, u, v));
        rgb.extend_from_slice(&ycbcr_to_rgb(y1, u, v));
    }
    Ok(rgb)
}

/// Replicate an 8-bit grayscale buffer into packed RGB.
pub fn grey_to_rgb(gray: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let pixels = (width * height) as usize;
    if gray.len() < pixels {
        return Err(FrameError::InvalidLength {
            format: "GREY",
            expected: pixels,
            actual: gray.len(),
        });
    }
    Ok(gray[..pixels].iter().flat_map(|&g| [g, g, g]).collect())
}

fn ycbcr_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let y = y as f32;
    let cb = u as f32 - 128.0;
    let cr = v as f32 - 128.0;
    let clamp = |x: f32| x.round().clamp(0.0, 255.0) as u8;
    [
        clamp(y + 1.402 * cr),
        clamp(y - 0.344_136 * cb - 0.714_136 * cr),
        clamp(y + 1.772 * cb),
    ]
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid {format} length: expected {expected}, got {actual}")]
    InvalidLength {
        format: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("image codec: {0}")]
    Codec(#[from] image::ImageError),
}
