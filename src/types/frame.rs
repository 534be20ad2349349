//! Image frames staged for multimodal prompts.

use thiserror::Error;

/// The only channel layout the vision encoder accepts (packed RGB).
pub const RGB_CHANNELS: u32 = 3;

/// Reasons a raw pixel buffer is refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("unsupported channel count {0}, expected {RGB_CHANNELS}")]
    UnsupportedChannels(u32),

    #[error("pixel buffer holds {actual} bytes, expected {expected} for {width}x{height}x{channels}")]
    LengthMismatch {
        width: u32,
        height: u32,
        channels: u32,
        expected: usize,
        actual: usize,
    },
}

/// An owned copy of one RGB frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageFrame {
    pixels: Vec<u8>,
    width: u32,
    height: u32,
}

impl ImageFrame {
    /// Copies `pixels` into a new frame after checking its shape.
    pub fn from_rgb(pixels: &[u8], width: u32, height: u32, channels: u32) -> Result<Self, FrameError> {
        if channels != RGB_CHANNELS {
            return Err(FrameError::UnsupportedChannels(channels));
        }
        let expected = width as usize * height as usize * channels as usize;
        if pixels.len() != expected {
            return Err(FrameError::LengthMismatch {
                width,
                height,
                channels,
                expected,
                actual: pixels.len(),
            });
        }
        Ok(Self {
            pixels: pixels.to_vec(),
            width,
            height,
        })
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u32 {
        RGB_CHANNELS
    }
}
