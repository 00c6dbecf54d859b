//! V4L2 still capture via the `v4l` crate.

use crate::frame::{Frame, FrameError, PixelFormat};
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Requested capture resolution; the driver may negotiate something else.
const REQUESTED_WIDTH: u32 = 640;
const REQUESTED_HEIGHT: u32 = 480;

/// Frames read after warm-up while looking for one that is not dark.
const STILL_ATTEMPTS: usize = 8;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device busy: {0}")]
    DeviceBusy(String),
    #[error("device {0} does not support video capture")]
    NotCaptureDevice(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("frame read failed: {0}")]
    ReadFailed(String),
    #[error("frame conversion failed: {0}")]
    Frame(#[from] FrameError),
    #[error("all {0} frames read after warm-up were dark")]
    AllFramesDark(usize),
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Open V4L2 capture device.
pub struct Camera {
    device: Device,
    pub device_path: String,
    pub width: u32,
    pub height: u32,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a V4L2 camera device by path (e.g., "/dev/video0").
    pub fn open(device_path: &str) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.raw_os_error() == Some(libc::EBUSY) {
                CameraError::DeviceBusy(device_path.to_string())
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("query capabilities: {e}")))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::NotCaptureDevice(device_path.to_string()));
        }

        let mut fmt = device
            .format()
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("get format: {e}")))?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = REQUESTED_WIDTH;
        fmt.height = REQUESTED_HEIGHT;

        let negotiated = device
            .set_format(&fmt)
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("set format: {e}")))?;

        let pixel_format = PixelFormat::from_fourcc(&negotiated.fourcc.repr).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format {} (need YUYV, GREY or Y16)",
                negotiated.fourcc
            ))
        })?;

        tracing::info!(
            device = device_path,
            card = %caps.card,
            width = negotiated.width,
            height = negotiated.height,
            format = ?pixel_format,
            "camera opened"
        );

        Ok(Self {
            device,
            device_path: device_path.to_string(),
            width: negotiated.width,
            height: negotiated.height,
            pixel_format,
        })
    }

    /// Start a stream, discard `warmup_frames` while exposure settles, then
    /// return the first frame that is not dark.
    pub fn capture_still(&self, warmup_frames: usize) -> Result<Frame, CameraError> {
        let mut stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, 4)
            .map_err(|e| CameraError::ReadFailed(format!("create mmap stream: {e}")))?;

        let frames = std::iter::from_fn(|| {
            Some(
                stream
                    .next()
                    .map_err(|e| CameraError::ReadFailed(format!("dequeue buffer: {e}")))
                    .and_then(|(buf, meta)| self.decode(buf, meta.sequence)),
            )
        });
        select_still(frames, warmup_frames, STILL_ATTEMPTS)
    }

    fn decode(&self, buf: &[u8], sequence: u32) -> Result<Frame, CameraError> {
        let (layout, data) = self.pixel_format.decode(buf, self.width, self.height)?;
        Ok(Frame {
            data,
            width: self.width,
            height: self.height,
            sequence,
            layout,
        })
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        (0..16)
            .filter_map(|i| {
                let path = format!("/dev/video{i}");
                if !Path::new(&path).exists() {
                    return None;
                }
                let caps = Device::with_path(&path).ok()?.query_caps().ok()?;
                if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                    return None;
                }
                Some(DeviceInfo {
                    path,
                    name: caps.card,
                    driver: caps.driver,
                    bus: caps.bus,
                })
            })
            .collect()
    }
}

/// Skip `warmup` frames, then take the first of up to `attempts` frames
/// that is not dark.
fn select_still<I>(mut frames: I, warmup: usize, attempts: usize) -> Result<Frame, CameraError>
where
    I: Iterator<Item = Result<Frame, CameraError>>,
{
    if warmup > 0 {
        tracing::debug!(count = warmup, "discarding warmup frames");
    }
    for _ in 0..warmup {
        if let Some(Err(e)) = frames.next() {
            return Err(e);
        }
    }

    let mut dark_skipped = 0;
    for frame in frames.take(attempts) {
        let frame = frame?;
        if !frame.is_dark() {
            tracing::debug!(seq = frame.sequence, dark_skipped, "still captured");
            return Ok(frame);
        }
        dark_skipped += 1;
        tracing::debug!(seq = frame.sequence, "skipping dark frame");
    }
    Err(CameraError::AllFramesDark(dark_skipped))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::ColorLayout;

    fn frame(sequence: u32, level: u8) -> Result<Frame, CameraError> {
        Ok(Frame {
            data: vec![level; 16],
            width: 4,
            height: 4,
            sequence,
            layout: ColorLayout::Luma,
        })
    }

    #[test]
    fn test_still_skips_warmup_and_dark_frames() {
        let frames = vec![frame(0, 200), frame(1, 200), frame(2, 0), frame(3, 0), frame(4, 150)];
        let still = select_still(frames.into_iter(), 2, 8).unwrap();
        assert_eq!(still.sequence, 4);
    }

    #[test]
    fn test_still_gives_up_on_dark_stream() {
        let frames = (0..20).map(|seq| frame(seq, 5));
        let err = select_still(frames, 1, 3).unwrap_err();
        assert!(matches!(err, CameraError::AllFramesDark(3)));
    }

    #[test]
    fn test_still_propagates_read_errors() {
        let frames = vec![Err(CameraError::ReadFailed("dequeue buffer: EIO".into())), frame(1, 200)];
        assert!(matches!(
            select_still(frames.into_iter(), 1, 8),
            Err(CameraError::ReadFailed(_))
        ));
    }
}
