//! Frame encoding
//!
//! Turns decoded RGB frames into standalone JPEG images for MJPEG parts.

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder as ImageJpegEncoder;
use image::ExtendedColorType;
use thiserror::Error;

use crate::camera::Frame;

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("frame is {width}x{height} but holds {actual} bytes, expected {expected}")]
    BufferSize {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },

    #[error("empty frame")]
    Empty,

    #[error("jpeg encoding failed: {0}")]
    Image(#[from] image::ImageError),
}

/// Stateless frame encoder. Implementations must be safe to call from
/// several pull loops at once.
pub trait FrameEncoder: Send + Sync {
    fn encode(&self, frame: &Frame) -> Result<Bytes, EncodeError>;
}

/// Baseline JPEG encoder for packed RGB8 frames.
#[derive(Debug, Clone, Copy)]
pub struct JpegEncoder {
    quality: u8,
}

impl JpegEncoder {
    /// `quality` is clamped to 1..=100.
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }
}

impl Default for JpegEncoder {
    fn default() -> Self {
        Self::new(80)
    }
}

impl FrameEncoder for JpegEncoder {
    fn encode(&self, frame: &Frame) -> Result<Bytes, EncodeError> {
        if frame.width == 0 || frame.height == 0 {
            return Err(EncodeError::Empty);
        }

        let expected = frame.width as usize * frame.height as usize * 3;
        if frame.data.len() != expected {
            return Err(EncodeError::BufferSize {
                width: frame.width,
                height: frame.height,
                expected,
                actual: frame.data.len(),
            });
        }

        let mut jpeg = Vec::with_capacity(expected / 8);
        let mut encoder = ImageJpegEncoder::new_with_quality(&mut jpeg, self.quality);
        encoder.encode(
            &frame.data,
            frame.width,
            frame.height,
            ExtendedColorType::Rgb8,
        )?;

        Ok(Bytes::from(jpeg))
    }
}
