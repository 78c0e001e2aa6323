//! footfall-hw — frame sources.
//!
//! A V4L2 camera for live capture and an image-directory replay source for
//! offline runs, both yielding luma frames through `FrameSource`.

pub mod camera;
pub mod frame;
pub mod replay;

pub use camera::{Camera, CameraConfig, CameraError, DeviceInfo};
pub use frame::{is_dark_frame, PixelFormat};
pub use replay::{load_luma, ImageSequence, ReplayError};
