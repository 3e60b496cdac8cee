//! Decoded bitmaps shared between the cache and UI bindings
//!
//! A [`Bitmap`] is plain RGBA8 pixel data. The cache hands out
//! [`SharedBitmap`] handles, so evicting or invalidating an entry only drops
//! the cache's own reference; a thumbnail still bound to a UI element stays
//! alive until that element lets go of it.

use std::sync::Arc;

/// Bytes per pixel for RGBA8 data
pub const BYTES_PER_PIXEL: usize = 4;

/// Fill colour used for synthesized video placeholders (RGBA)
pub const PLACEHOLDER_COLOR: [u8; 4] = [0x2b, 0x2d, 0x31, 0xff];

/// Reference-counted bitmap handle
pub type SharedBitmap = Arc<Bitmap>;

/// Decoded image in RGBA8 format
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    /// Width in pixels
    pub width: u32,

    /// Height in pixels
    pub height: u32,

    /// Raw pixel data (RGBA, row-major, no padding)
    pub pixels: Vec<u8>,
}

impl Bitmap {
    /// Create a bitmap from raw RGBA pixels
    ///
    /// Returns `None` if the buffer length does not match the dimensions.
    pub fn from_rgba(width: u32, height: u32, pixels: Vec<u8>) -> Option<Self> {
        let expected = width as usize * height as usize * BYTES_PER_PIXEL;
        if pixels.len() != expected {
            return None;
        }
        Some(Self {
            width,
            height,
            pixels,
        })
    }

    /// Create a bitmap filled with a single colour
    pub fn solid(width: u32, height: u32, color: [u8; 4]) -> Self {
        let pixel_count = width as usize * height as usize;
        let mut pixels = Vec::with_capacity(pixel_count * BYTES_PER_PIXEL);
        for _ in 0..pixel_count {
            pixels.extend_from_slice(&color);
        }
        Self {
            width,
            height,
            pixels,
        }
    }

    /// Synthesize the 16:9 placeholder shown for video files
    ///
    /// Height is `width * 9 / 16`, never less than one pixel.
    pub fn video_placeholder(width: u32) -> Self {
        let width = width.max(1);
        Self::solid(width, placeholder_height(width), PLACEHOLDER_COLOR)
    }

    /// Estimated memory footprint (`width * height * 4`)
    pub fn estimated_bytes(&self) -> usize {
        self.width as usize * self.height as usize * BYTES_PER_PIXEL
    }

    /// True if the bitmap has no pixels
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Wrap into a shared handle
    pub fn into_shared(self) -> SharedBitmap {
        Arc::new(self)
    }
}

fn placeholder_height(width: u32) -> u32 {
    let height = u64::from(width) * 9 / 16;
    (height as u32).max(1)
}
