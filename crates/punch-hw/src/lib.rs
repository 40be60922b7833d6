//! punch-hw: Frame capture for the recognition pipeline.
//!
//! Provides the grayscale `Frame` type, the bounded latest-frame buffer,
//! the `FrameSource` contract and a V4L2 camera implementing it.

pub mod buffer;
pub mod camera;
pub mod frame;
pub mod source;

pub use buffer::FrameBuffer;
pub use camera::{Camera, CameraError, PixelFormat};
pub use frame::Frame;
pub use source::{CapturePump, FrameSource};
