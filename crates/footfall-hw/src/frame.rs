//! Raw buffer to 8-bit luma conversion and dark-frame detection.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("{format:?} buffer too short: expected {expected} bytes, got {actual}")]
    ShortBuffer {
        format: PixelFormat,
        expected: usize,
        actual: usize,
    },
}

/// Pixel layouts the camera accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Packed 4:2:2, `[Y0 U Y1 V]` per pixel pair.
    Yuyv,
    /// 8-bit luma.
    Grey,
    /// 16-bit little-endian luma.
    Y16,
}

impl PixelFormat {
    pub fn from_fourcc(code: &[u8; 4]) -> Option<Self> {
        match code {
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"GREY" => Some(PixelFormat::Grey),
            b"Y16 " | b"Y16\0" => Some(PixelFormat::Y16),
            _ => None,
        }
    }

    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Grey => 1,
            PixelFormat::Yuyv | PixelFormat::Y16 => 2,
        }
    }
}

/// Convert one driver buffer to `width * height` luma bytes.
pub fn to_luma(format: PixelFormat, buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let pixels = width as usize * height as usize;
    let expected = pixels * format.bytes_per_pixel();
    if buf.len() < expected {
        return Err(FrameError::ShortBuffer { format, expected, actual: buf.len() });
    }

    let luma = match format {
        PixelFormat::Grey => buf[..pixels].to_vec(),
        // Y sits on every even byte.
        PixelFormat::Yuyv => buf[..expected].iter().step_by(2).copied().collect(),
        // Keep the high byte.
        PixelFormat::Y16 => buf[..expected].chunks_exact(2).map(|px| px[1]).collect(),
    };
    Ok(luma)
}

/// Extract the Y channel of a packed YUYV buffer.
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    to_luma(PixelFormat::Yuyv, yuyv, width, height)
}

/// True if more than `threshold` of the pixels fall below 32.
///
/// Cameras emit a few black frames after stream-on and under exposure
/// adjustment; these never contain a detectable face.
pub fn is_dark_frame(gray: &[u8], threshold: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark = gray.iter().filter(|&&p| p < 32).count();
    dark as f32 / gray.len() as f32 > threshold
}
