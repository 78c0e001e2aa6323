//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, PixelFormat};
use footfall_core::{Frame, FrameSource, SourceError};
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const STREAM_BUFFERS: u32 = 4;

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
}

impl From<CameraError> for SourceError {
    fn from(e: CameraError) -> Self {
        match e {
            CameraError::CaptureFailed(msg) => SourceError::ReadFailed(msg),
            other => SourceError::Unavailable(other.to_string()),
        }
    }
}

/// Requested capture settings. The driver may pick something close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraConfig {
    pub device: String,
    pub width: u32,
    pub height: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            width: 1280,
            height: 720,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// An open V4L2 capture device streaming through mmap buffers.
pub struct Camera {
    config: CameraConfig,
    device: Device,
    stream: Option<MmapStream<'static>>,
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
}

impl Camera {
    pub fn open(config: CameraConfig) -> Result<Self, CameraError> {
        let (device, width, height, pixel_format) = negotiate(&config)?;
        Ok(Self {
            config,
            device,
            stream: None,
            width,
            height,
            pixel_format,
        })
    }

    pub fn device_path(&self) -> &str {
        &self.config.device
    }

    /// Negotiated frame size.
    pub fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    /// Dequeue one frame, starting the stream on first use.
    pub fn capture(&mut self) -> Result<Frame, CameraError> {
        if self.stream.is_none() {
            let stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
                .map_err(|e| CameraError::CaptureFailed(format!("failed to start mmap stream: {e}")))?;
            self.stream = Some(stream);
        }
        let Some(stream) = self.stream.as_mut() else {
            return Err(CameraError::CaptureFailed("stream not started".into()));
        };

        let (buf, meta) = stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;
        let sequence = meta.sequence;

        let luma = frame::to_luma(self.pixel_format, buf, self.width, self.height)
            .map_err(|e| CameraError::CaptureFailed(e.to_string()))?;
        if frame::is_dark_frame(&luma, 0.95) {
            tracing::trace!(sequence, "dark frame");
        }

        Ok(Frame::new(luma, self.width, self.height).with_sequence(sequence))
    }

    /// Close and reopen the device with the original settings.
    pub fn reopen(&mut self) -> Result<(), CameraError> {
        self.stream = None;
        let (device, width, height, pixel_format) = negotiate(&self.config)?;
        self.device = device;
        self.width = width;
        self.height = height;
        self.pixel_format = pixel_format;
        tracing::info!(device = %self.config.device, "camera reopened");
        Ok(())
    }

    /// Video capture devices among `/dev/video0..15`.
    pub fn list_devices() -> Vec<DeviceInfo> {
        (0..16)
            .map(|i| format!("/dev/video{i}"))
            .filter(|path| Path::new(path).exists())
            .filter_map(|path| {
                let caps = Device::with_path(&path).ok()?.query_caps().ok()?;
                caps.capabilities
                    .contains(v4l::capability::Flags::VIDEO_CAPTURE)
                    .then(|| DeviceInfo {
                        name: caps.card.clone(),
                        driver: caps.driver.clone(),
                        bus: caps.bus.clone(),
                        path,
                    })
            })
            .collect()
    }
}

impl FrameSource for Camera {
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        Ok(Some(self.capture()?))
    }

    fn reset(&mut self) -> Result<(), SourceError> {
        Ok(self.reopen()?)
    }
}

/// Open the device and settle on a format: YUYV at the requested size,
/// accepting GREY or Y16 if the driver insists.
fn negotiate(config: &CameraConfig) -> Result<(Device, u32, u32, PixelFormat), CameraError> {
    let path = config.device.as_str();
    if !Path::new(path).exists() {
        return Err(CameraError::DeviceNotFound(path.to_string()));
    }

    let device = Device::with_path(path).map_err(|e| {
        if e.raw_os_error() == Some(16) || e.to_string().contains("busy") {
            CameraError::DeviceBusy(path.to_string())
        } else {
            CameraError::DeviceNotFound(format!("{path}: {e}"))
        }
    })?;

    let caps = device
        .query_caps()
        .map_err(|e| CameraError::CaptureFailed(format!("failed to query capabilities: {e}")))?;
    if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
        return Err(CameraError::NotCaptureDevice(path.to_string()));
    }

    let mut fmt = device
        .format()
        .map_err(|e| CameraError::FormatNegotiationFailed(format!("failed to get format: {e}")))?;
    fmt.fourcc = FourCC::new(b"YUYV");
    fmt.width = config.width;
    fmt.height = config.height;

    let negotiated = device
        .set_format(&fmt)
        .map_err(|e| CameraError::FormatNegotiationFailed(format!("failed to set format: {e}")))?;
    let pixel_format = PixelFormat::from_fourcc(&negotiated.fourcc.repr).ok_or_else(|| {
        CameraError::FormatNegotiationFailed(format!(
            "unsupported pixel format {} (need YUYV, GREY or Y16)",
            negotiated.fourcc
        ))
    })?;

    tracing::info!(
        device = path,
        card = %caps.card,
        driver = %caps.driver,
        width = negotiated.width,
        height = negotiated.height,
        format = ?pixel_format,
        "camera opened"
    );

    Ok((device, negotiated.width, negotiated.height, pixel_format))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_device_is_unavailable() {
        let err = Camera::open(CameraConfig {
            device: "/dev/video-nonexistent".into(),
            ..CameraConfig::default()
        })
        .err()
        .unwrap();
        assert!(matches!(err, CameraError::DeviceNotFound(_)));
        assert!(matches!(SourceError::from(err), SourceError::Unavailable(_)));
    }

    #[test]
    fn test_capture_failure_maps_to_read_failure() {
        let e = SourceError::from(CameraError::CaptureFailed("EIO".into()));
        assert!(matches!(e, SourceError::ReadFailed(_)));
    }
}
