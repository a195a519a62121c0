use image::{Rgb, RgbImage};
use serde::{Deserialize, Serialize};

use crate::VisionError;

/// Region of a slot screenshot whose border is checked for the red selection
/// frame the game draws around the active slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionBox {
    pub x: u32,
    pub y: u32,
    /// Extends to the image edge when unset
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Fraction of border pixels that must be highlight-coloured
    pub highlight_threshold: f32,
}

impl Default for SelectionBox {
    fn default() -> Self {
        Self {
            x: 0,
            y: 0,
            width: None,
            height: None,
            highlight_threshold: 0.5,
        }
    }
}

fn is_highlight(pixel: &Rgb<u8>) -> bool {
    let [r, g, b] = pixel.0;
    r >= 150 && r.saturating_sub(g) >= 60 && r.saturating_sub(b) >= 60
}

impl SelectionBox {
    pub fn new(
        x: u32,
        y: u32,
        width: Option<u32>,
        height: Option<u32>,
        highlight_threshold: f32,
    ) -> Self {
        Self {
            x,
            y,
            width,
            height,
            highlight_threshold,
        }
    }

    /// Region clipped to the image, as (x0, y0, x1, y1) with exclusive ends
    fn bounds(&self, img: &RgbImage) -> Result<(u32, u32, u32, u32), VisionError> {
        let (w, h) = img.dimensions();
        if self.x >= w || self.y >= h {
            return Err(VisionError::RegionOutOfBounds {
                width: w,
                height: h,
            });
        }
        let x1 = self
            .width
            .map(|rw| self.x.saturating_add(rw).min(w))
            .unwrap_or(w);
        let y1 = self
            .height
            .map(|rh| self.y.saturating_add(rh).min(h))
            .unwrap_or(h);
        Ok((self.x, self.y, x1, y1))
    }

    /// Fraction of the region's one-pixel border that is highlight-coloured
    pub fn highlight_fraction(&self, img: &RgbImage) -> Result<f32, VisionError> {
        let (x0, y0, x1, y1) = self.bounds(img)?;

        let mut total = 0u32;
        let mut lit = 0u32;
        for y in y0..y1 {
            for x in x0..x1 {
                let on_border = x == x0 || x == x1 - 1 || y == y0 || y == y1 - 1;
                if !on_border {
                    continue;
                }
                total += 1;
                if is_highlight(img.get_pixel(x, y)) {
                    lit += 1;
                }
            }
        }

        if total == 0 {
            return Ok(0.0);
        }
        Ok(lit as f32 / total as f32)
    }

    pub fn is_highlighted(&self, img: &RgbImage) -> Result<bool, VisionError> {
        Ok(self.highlight_fraction(img)? >= self.highlight_threshold)
    }
}
