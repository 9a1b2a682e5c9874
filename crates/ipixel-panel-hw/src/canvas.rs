//! RGB888 canvas spanning every stacked unit.

use std::ops::Range;

use crate::{Error, Result};

/// Bytes per RGB888 pixel.
pub const BYTES_PER_PIXEL: usize = 3;

/// An RGB color triple.
pub type Rgb = [u8; 3];

/// Black.
pub const BLACK: Rgb = [0, 0, 0];

/// Logical image handed over by the renderer, already composed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Canvas {
    /// Pixel data, row-major, 3 bytes per pixel.
    data: Vec<u8>,
    width: u32,
    height: u32,
}

impl Canvas {
    /// Creates a canvas initialized to black.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            data: vec![0; width as usize * height as usize * BYTES_PER_PIXEL],
            width,
            height,
        }
    }

    /// Wraps an existing RGB8 buffer.
    pub fn from_rgb8(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * BYTES_PER_PIXEL;
        if data.len() != expected {
            return Err(Error::Config(format!(
                "canvas buffer size mismatch: expected {} bytes for {}x{}, got {}",
                expected,
                width,
                height,
                data.len()
            )));
        }
        Ok(Self {
            data,
            width,
            height,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Returns the raw pixel bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Number of bytes in one row.
    pub fn stride(&self) -> usize {
        self.width as usize * BYTES_PER_PIXEL
    }

    /// Returns the bytes of a contiguous row range, or `None` if out of bounds.
    pub fn rows(&self, rows: Range<u32>) -> Option<&[u8]> {
        if rows.start > rows.end || rows.end > self.height {
            return None;
        }
        let stride = self.stride();
        Some(&self.data[rows.start as usize * stride..rows.end as usize * stride])
    }

    /// Sets a pixel; out-of-range coordinates are ignored.
    pub fn set_pixel(&mut self, x: u32, y: u32, color: Rgb) {
        if let Some(idx) = self.index(x, y) {
            self.data[idx..idx + BYTES_PER_PIXEL].copy_from_slice(&color);
        }
    }

    /// Gets a pixel at the given coordinates.
    pub fn get_pixel(&self, x: u32, y: u32) -> Option<Rgb> {
        self.index(x, y)
            .map(|idx| [self.data[idx], self.data[idx + 1], self.data[idx + 2]])
    }

    /// Fills a rectangle, clipped to the canvas.
    pub fn fill_rect(&mut self, x: u32, y: u32, width: u32, height: u32, color: Rgb) {
        for dy in 0..height {
            for dx in 0..width {
                self.set_pixel(x + dx, y + dy, color);
            }
        }
    }

    /// Fills the whole canvas.
    pub fn fill(&mut self, color: Rgb) {
        for px in self.data.chunks_exact_mut(BYTES_PER_PIXEL) {
            px.copy_from_slice(&color);
        }
    }

    fn index(&self, x: u32, y: u32) -> Option<usize> {
        if x < self.width && y < self.height {
            Some((y as usize * self.width as usize + x as usize) * BYTES_PER_PIXEL)
        } else {
            None
        }
    }
}
