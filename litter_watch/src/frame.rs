use crate::error::{Error, Result};
use image::RgbImage;
use std::sync::Arc;
use std::time::Instant;

/// A decoded frame: packed RGB8 pixels plus capture metadata.
///
/// Pixel data sits behind an `Arc`, so cloning a frame (into the ring buffer or
/// into a snapshot) never copies pixels, and no holder can mutate them.
#[derive(Debug, Clone)]
pub struct Frame {
    pub index: u64,
    pub width: u32,
    pub height: u32,
    /// Monotonic capture time. All tracking and cooldown decisions use this clock.
    pub captured_at: Instant,
    data: Arc<[u8]>,
}

impl Frame {
    pub fn new(index: u64, width: u32, height: u32, captured_at: Instant, data: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * 3;
        if data.len() != expected {
            return Err(Error::InvalidFrame(format!(
                "{}x{} RGB frame needs {} bytes, got {}",
                width,
                height,
                expected,
                data.len()
            )));
        }
        Ok(Self {
            index,
            width,
            height,
            captured_at,
            data: data.into(),
        })
    }

    /// A frame filled with one color. Useful for synthetic sources.
    pub fn solid(index: u64, width: u32, height: u32, captured_at: Instant, rgb: [u8; 3]) -> Self {
        let data: Vec<u8> = rgb.iter().copied().cycle().take(width as usize * height as usize * 3).collect();
        Self {
            index,
            width,
            height,
            captured_at,
            data: data.into(),
        }
    }

    pub fn from_image(index: u64, captured_at: Instant, image: RgbImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            index,
            width,
            height,
            captured_at,
            data: image.into_raw().into(),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Copies the pixels into an owned image for cropping or drawing.
    pub fn to_image(&self) -> Result<RgbImage> {
        RgbImage::from_raw(self.width, self.height, self.data.to_vec())
            .ok_or_else(|| Error::InvalidFrame(format!("frame {} has a truncated buffer", self.index)))
    }

    /// Whether two handles point at the same pixel allocation.
    pub fn shares_pixels_with(&self, other: &Frame) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

/// Where frames come from. `Ok(None)` marks the end of the stream.
///
/// Reads may block until the next frame is available.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Result<Option<Frame>>;
}

/// Adapts any frame iterator (a pre-decoded clip, a synthetic generator) into a source.
pub struct IterSource<I>(pub I);

impl<I> FrameSource for IterSource<I>
where
    I: Iterator<Item = Frame> + Send,
{
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        Ok(self.0.next())
    }
}
