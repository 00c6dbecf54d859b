//! Captured frame type and raw-buffer decoding.
//!
//! YUYV frames decode to RGB so the still handed to the embedding helper
//! keeps its colour; the grayscale formats stay single-channel.

use image::{GrayImage, RgbImage};
use std::path::Path;

/// Pixel values below this count as black for dark-frame detection.
const DARK_PIXEL: u8 = 32;
/// Share of black pixels above which a frame is considered dark.
const DARK_RATIO: f32 = 0.95;

/// Pixel layouts the camera may negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel, luma in every even byte).
    Yuyv,
    /// 8-bit grayscale.
    Grey,
    /// 16-bit little-endian grayscale.
    Y16,
}

/// Channel layout of a decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorLayout {
    Luma,
    Rgb,
}

impl ColorLayout {
    pub fn channels(self) -> usize {
        match self {
            Self::Luma => 1,
            Self::Rgb => 3,
        }
    }
}

impl PixelFormat {
    /// Map a V4L2 FourCC code to a supported format.
    pub fn from_fourcc(code: &[u8; 4]) -> Option<Self> {
        match code {
            b"YUYV" => Some(Self::Yuyv),
            b"GREY" => Some(Self::Grey),
            b"Y16 " | b"Y16\0" => Some(Self::Y16),
            _ => None,
        }
    }

    /// Decode one raw buffer of `width * height` pixels.
    pub fn decode(self, buf: &[u8], width: u32, height: u32) -> Result<(ColorLayout, Vec<u8>), FrameError> {
        let pixels = (width * height) as usize;
        let expected = match self {
            Self::Grey => pixels,
            Self::Yuyv | Self::Y16 => pixels * 2,
        };
        if buf.len() < expected {
            return Err(FrameError::InvalidLength {
                format: self,
                expected,
                actual: buf.len(),
            });
        }

        Ok(match self {
            Self::Grey => (ColorLayout::Luma, buf[..pixels].to_vec()),
            Self::Yuyv => (ColorLayout::Rgb, yuyv_to_rgb(&buf[..expected])),
            // Keep the high byte of each little-endian sample.
            Self::Y16 => (
                ColorLayout::Luma,
                buf[..expected].chunks_exact(2).map(|px| px[1]).collect(),
            ),
        })
    }
}

/// BT.601 full-range conversion; each `Y0 U Y1 V` group yields two pixels.
fn yuyv_to_rgb(buf: &[u8]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(buf.len() / 2 * 3);
    for group in buf.chunks_exact(4) {
        let (u, v) = (group[1], group[3]);
        rgb.extend_from_slice(&ycbcr_to_rgb(group[0], u, v));
        rgb.extend_from_slice(&ycbcr_to_rgb(group[2], u, v));
    }
    if let [y, _] = buf.chunks_exact(4).remainder() {
        rgb.extend_from_slice(&[*y, *y, *y]);
    }
    rgb
}

fn ycbcr_to_rgb(y: u8, cb: u8, cr: u8) -> [u8; 3] {
    let y = f32::from(y);
    let cb = f32::from(cb) - 128.0;
    let cr = f32::from(cr) - 128.0;
    let channel = |v: f32| v.round().clamp(0.0, 255.0) as u8;
    [
        channel(y + 1.402 * cr),
        channel(y - 0.344_136 * cb - 0.714_136 * cr),
        channel(y + 1.772 * cb),
    ]
}

/// A captured camera frame.
#[derive(Clone)]
pub struct Frame {
    /// Interleaved pixel data, `width * height * layout.channels()` bytes.
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub sequence: u32,
    pub layout: ColorLayout,
}

impl Frame {
    /// Per-pixel luma, whatever the layout.
    fn luma(&self) -> impl Iterator<Item = u8> + '_ {
        self.data
            .chunks_exact(self.layout.channels())
            .map(|px| match px {
                [r, g, b] => {
                    (0.299 * f32::from(*r) + 0.587 * f32::from(*g) + 0.114 * f32::from(*b)).round() as u8
                }
                [y, ..] => *y,
                [] => 0,
            })
    }

    /// Nearly all black: a frame from before exposure settled, or a
    /// covered lens.
    pub fn is_dark(&self) -> bool {
        let (mut total, mut dark) = (0usize, 0usize);
        for y in self.luma() {
            total += 1;
            if y < DARK_PIXEL {
                dark += 1;
            }
        }
        total == 0 || dark as f32 / total as f32 > DARK_RATIO
    }

    /// Encode the frame to `path`; the format follows the file extension.
    pub fn save(&self, path: &Path) -> Result<(), FrameError> {
        let invalid = || FrameError::Geometry {
            width: self.width,
            height: self.height,
            layout: self.layout,
            actual: self.data.len(),
        };
        match self.layout {
            ColorLayout::Luma => GrayImage::from_raw(self.width, self.height, self.data.clone())
                .ok_or_else(invalid)?
                .save(path)?,
            ColorLayout::Rgb => RgbImage::from_raw(self.width, self.height, self.data.clone())
                .ok_or_else(invalid)?
                .save(path)?,
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid {format:?} buffer length: expected {expected}, got {actual}")]
    InvalidLength {
        format: PixelFormat,
        expected: usize,
        actual: usize,
    },
    #[error("{actual} bytes do not fill a {width}x{height} {layout:?} frame")]
    Geometry {
        width: u32,
        height: u32,
        layout: ColorLayout,
        actual: usize,
    },
    #[error("image encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn luma_frame(data: Vec<u8>, width: u32, height: u32) -> Frame {
        Frame { data, width, height, sequence: 0, layout: ColorLayout::Luma }
    }

    #[test]
    fn test_yuyv_neutral_chroma_is_gray() {
        // 2x1 image: [Y0=100, U=128, Y1=200, V=128]
        let (layout, rgb) = PixelFormat::Yuyv.decode(&[100, 128, 200, 128], 2, 1).unwrap();
        assert_eq!(layout, ColorLayout::Rgb);
        assert_eq!(rgb, vec![100, 100, 100, 200, 200, 200]);
    }

    #[test]
    fn test_yuyv_keeps_colour() {
        let (_, rgb) = PixelFormat::Yuyv.decode(&[76, 85, 76, 255], 2, 1).unwrap();
        assert_eq!(rgb, vec![254, 0, 0, 254, 0, 0]);
    }

    #[test]
    fn test_y16_keeps_high_byte() {
        let (layout, gray) = PixelFormat::Y16.decode(&[0xFF, 0x12, 0x00, 0xAB], 2, 1).unwrap();
        assert_eq!(layout, ColorLayout::Luma);
        assert_eq!(gray, vec![0x12, 0xAB]);
    }

    #[test]
    fn test_grey_truncates_padding() {
        let (_, gray) = PixelFormat::Grey.decode(&[1, 2, 3, 4, 99], 2, 2).unwrap();
        assert_eq!(gray, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_short_buffer_rejected() {
        assert!(PixelFormat::Yuyv.decode(&[100, 128], 2, 1).is_err());
    }

    #[test]
    fn test_fourcc_mapping() {
        assert_eq!(PixelFormat::from_fourcc(b"GREY"), Some(PixelFormat::Grey));
        assert_eq!(PixelFormat::from_fourcc(b"Y16 "), Some(PixelFormat::Y16));
        assert_eq!(PixelFormat::from_fourcc(b"MJPG"), None);
    }

    #[test]
    fn test_dark_frame_detection() {
        assert!(luma_frame(vec![0; 100], 10, 10).is_dark());
        assert!(!luma_frame(vec![120; 100], 10, 10).is_dark());

        let mut mostly_black = vec![0u8; 100];
        mostly_black[..10].fill(200);
        assert!(!luma_frame(mostly_black, 10, 10).is_dark());

        let rgb = Frame { data: vec![10, 10, 10, 250, 250, 250], width: 2, height: 1, sequence: 0, layout: ColorLayout::Rgb };
        assert!(!rgb.is_dark());
    }

    #[test]
    fn test_save_gray_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.png");
        luma_frame(vec![10, 20, 30, 40], 2, 2).save(&path).unwrap();
        let loaded = image::open(&path).unwrap().to_luma8();
        assert_eq!(loaded.into_raw(), vec![10, 20, 30, 40]);
    }

    #[test]
    fn test_save_rgb_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.png");
        let frame = Frame { data: vec![255, 0, 0, 0, 0, 255], width: 2, height: 1, sequence: 0, layout: ColorLayout::Rgb };
        frame.save(&path).unwrap();
        let loaded = image::open(&path).unwrap().to_rgb8();
        assert_eq!(loaded.into_raw(), vec![255, 0, 0, 0, 0, 255]);
    }
}
