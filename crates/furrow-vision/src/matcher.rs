use image::GrayImage;
use std::path::Path;
use tracing::debug;

use crate::catalog::{thumbnail, IconCatalog};
use crate::{open_image, SelectionBox, TemplateMatcher, VisionError};

/// Result of matching one screenshot
#[derive(Debug, Clone, PartialEq)]
pub struct IconMatch {
    pub name: String,
    /// Mean absolute grey-level difference, 0 (identical) to 1
    pub distance: f32,
}

/// Compares normalised grayscale thumbnails by mean absolute difference
#[derive(Debug, Clone)]
pub struct PixelTemplateMatcher {
    threshold: f32,
}

impl PixelTemplateMatcher {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }
}

/// Mean absolute difference of two equally sized grayscale images, scaled to 0..1
pub fn mean_abs_diff(a: &GrayImage, b: &GrayImage) -> f32 {
    let total: u64 = a
        .pixels()
        .zip(b.pixels())
        .map(|(p, q)| u64::from(p.0[0].abs_diff(q.0[0])))
        .sum();
    let count = u64::from(a.width()) * u64::from(a.height());
    if count == 0 {
        return 1.0;
    }
    total as f32 / (count as f32 * 255.0)
}

impl TemplateMatcher for PixelTemplateMatcher {
    fn best_match(
        &self,
        screenshot: &Path,
        catalog: &IconCatalog,
    ) -> Result<Option<IconMatch>, VisionError> {
        let shot = thumbnail(&open_image(screenshot)?);

        let best = catalog
            .icons()
            .iter()
            .map(|icon| (icon, mean_abs_diff(&shot, &icon.thumbnail)))
            .min_by(|a, b| a.1.total_cmp(&b.1));

        let Some((icon, distance)) = best else {
            return Ok(None);
        };

        debug!(
            "Closest icon for {} is {} (distance {:.3})",
            screenshot.display(),
            icon.name,
            distance
        );

        if distance <= self.threshold {
            Ok(Some(IconMatch {
                name: icon.name.clone(),
                distance,
            }))
        } else {
            Ok(None)
        }
    }

    fn is_selected(&self, screenshot: &Path, region: &SelectionBox) -> Result<bool, VisionError> {
        let img = open_image(screenshot)?.to_rgb8();
        region.is_highlighted(&img)
    }

    fn name(&self) -> &str {
        "pixel"
    }
}
