//! Frame buffer
//!
//! Image frames staged for the next multimodal build.

use crate::types::{FrameError, ImageFrame};

/// Ordered frames waiting to be turned into a multimodal prompt.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    frames: Vec<ImageFrame>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies an RGB frame into the buffer. Rejected frames leave the
    /// buffer untouched.
    pub fn add(&mut self, pixels: &[u8], width: u32, height: u32, channels: u32) -> Result<(), FrameError> {
        let frame = ImageFrame::from_rgb(pixels, width, height, channels)?;
        self.frames.push(frame);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frames(&self) -> &[ImageFrame] {
        &self.frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_rgb_frames_never_grow_the_buffer() {
        let mut frames = FrameBuffer::new();
        for channels in [0, 1, 2, 4, 5] {
            let pixels = vec![0u8; 4 * channels as usize];
            assert!(frames.add(&pixels, 2, 2, channels).is_err());
            assert_eq!(frames.len(), 0);
        }
    }

    #[test]
    fn test_add_and_clear() {
        let mut frames = FrameBuffer::new();
        frames.add(&[1u8; 12], 2, 2, 3).unwrap();
        frames.add(&[2u8; 27], 3, 3, 3).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames.frames()[1].width(), 3);

        assert!(frames.add(&[0u8; 5], 2, 2, 3).is_err());
        assert_eq!(frames.len(), 2);

        frames.clear();
        assert!(frames.is_empty());
    }
}
