//! V4L2 camera frame source via the `v4l` crate.

use crate::frame::{self, Frame};
use crate::source::FrameSource;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel, extract Y channel).
    Yuyv,
    /// 8-bit grayscale.
    Grey,
    /// 16-bit little-endian grayscale.
    Y16,
}

struct OpenDevice {
    device: Device,
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
}

/// V4L2 camera exposed as a [`FrameSource`]. Reopened in place by
/// [`FrameSource::reinitialize`].
pub struct Camera {
    device_path: String,
    requested: (u32, u32),
    state: Mutex<Option<OpenDevice>>,
    active: AtomicBool,
}

impl Camera {
    /// Open a V4L2 device (e.g. "/dev/video0") at the requested resolution.
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        let opened = open_device(device_path, width, height)?;
        Ok(Self {
            device_path: device_path.to_string(),
            requested: (width, height),
            state: Mutex::new(Some(opened)),
            active: AtomicBool::new(true),
        })
    }

    /// A camera that starts closed. Reads miss until a successful
    /// [`FrameSource::reinitialize`].
    pub fn detached(device_path: &str, width: u32, height: u32) -> Self {
        Self {
            device_path: device_path.to_string(),
            requested: (width, height),
            state: Mutex::new(None),
            active: AtomicBool::new(false),
        }
    }

    pub fn device_path(&self) -> &str {
        &self.device_path
    }

    /// Negotiated `(width, height)`, if the device is open.
    pub fn resolution(&self) -> Option<(u32, u32)> {
        self.state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .map(|d| (d.width, d.height))
    }

    /// Release the device. The source reports inactive until reinitialized.
    pub fn close(&self) {
        self.active.store(false, Ordering::Release);
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = None;
    }

    fn capture(open: &OpenDevice) -> Result<Frame, CameraError> {
        let mut stream = MmapStream::with_buffers(&open.device, BufType::VideoCapture, 4)
            .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;

        let (buf, meta) = stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;

        let (w, h) = (open.width, open.height);
        let gray = match open.pixel_format {
            PixelFormat::Grey => {
                let pixels = (w * h) as usize;
                if buf.len() < pixels {
                    return Err(CameraError::CaptureFailed(format!(
                        "GREY buffer too short: expected {pixels}, got {}",
                        buf.len()
                    )));
                }
                buf[..pixels].to_vec()
            }
            PixelFormat::Y16 => frame::y16_to_grayscale(buf, w, h)
                .map_err(|e| CameraError::CaptureFailed(format!("Y16 conversion failed: {e}")))?,
            PixelFormat::Yuyv => frame::yuyv_to_grayscale(buf, w, h)
                .map_err(|e| CameraError::CaptureFailed(format!("YUYV conversion failed: {e}")))?,
        };

        Frame::new(gray, w, h, meta.sequence)
            .map_err(|e| CameraError::CaptureFailed(e.to_string()))
    }
}

impl FrameSource for Camera {
    fn read_frame(&self) -> Option<Frame> {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let open = state.as_ref()?;
        match Self::capture(open) {
            Ok(frame) => Some(frame),
            Err(e) => {
                tracing::debug!(device = %self.device_path, error = %e, "frame capture missed");
                None
            }
        }
    }

    fn reinitialize(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        // Drop the old handle first so the driver releases the device.
        *state = None;
        let (width, height) = self.requested;
        match open_device(&self.device_path, width, height) {
            Ok(opened) => {
                tracing::info!(device = %self.device_path, "camera reinitialized");
                *state = Some(opened);
                self.active.store(true, Ordering::Release);
                true
            }
            Err(e) => {
                tracing::warn!(device = %self.device_path, error = %e, "camera reinitialization failed");
                self.active.store(false, Ordering::Release);
                false
            }
        }
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

fn open_device(device_path: &str, width: u32, height: u32) -> Result<OpenDevice, CameraError> {
    if !Path::new(device_path).exists() {
        return Err(CameraError::DeviceNotFound(device_path.to_string()));
    }

    let device = Device::with_path(device_path).map_err(|e| {
        if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
            CameraError::DeviceBusy
        } else {
            CameraError::DeviceNotFound(format!("{device_path}: {e}"))
        }
    })?;

    let caps = device
        .query_caps()
        .map_err(|e| CameraError::CaptureFailed(format!("failed to query capabilities: {e}")))?;
    if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
        return Err(CameraError::StreamingNotSupported);
    }

    let mut fmt = device
        .format()
        .map_err(|e| CameraError::FormatNegotiationFailed(format!("failed to get format: {e}")))?;
    fmt.fourcc = FourCC::new(b"YUYV");
    fmt.width = width;
    fmt.height = height;

    let negotiated = device
        .set_format(&fmt)
        .map_err(|e| CameraError::FormatNegotiationFailed(format!("failed to set format: {e}")))?;

    let fourcc = negotiated.fourcc;
    let pixel_format = if fourcc == FourCC::new(b"GREY") {
        PixelFormat::Grey
    } else if fourcc == FourCC::new(b"YUYV") {
        PixelFormat::Yuyv
    } else if fourcc == FourCC::new(b"Y16 ") {
        PixelFormat::Y16
    } else {
        return Err(CameraError::FormatNegotiationFailed(format!(
            "unsupported pixel format: {fourcc:?} (need YUYV, GREY, or Y16)"
        )));
    };

    tracing::info!(
        device = device_path,
        card = %caps.card,
        width = negotiated.width,
        height = negotiated.height,
        fourcc = ?fourcc,
        "camera opened"
    );

    Ok(OpenDevice {
        device,
        width: negotiated.width,
        height: negotiated.height,
        pixel_format,
    })
}
