//! Image-level perception for the toolbar: matching slot screenshots against a
//! catalog of icon templates and detecting which slot carries the selection
//! highlight.

pub mod catalog;
pub mod error;
pub mod matcher;
pub mod selection;

pub use catalog::{Icon, IconCatalog};
pub use error::VisionError;
pub use matcher::{IconMatch, PixelTemplateMatcher};
pub use selection::SelectionBox;

use std::path::Path;

/// Matches a slot screenshot against icon templates
pub trait TemplateMatcher: Send + Sync {
    /// Closest catalog icon within the match threshold, or `None`
    fn best_match(
        &self,
        screenshot: &Path,
        catalog: &IconCatalog,
    ) -> Result<Option<IconMatch>, VisionError>;

    /// Whether the screenshot shows the selection highlight inside `region`
    fn is_selected(&self, screenshot: &Path, region: &SelectionBox) -> Result<bool, VisionError>;

    /// Get the name of the matcher
    fn name(&self) -> &str;
}

/// Open an image file, mapping failures to [`VisionError`]
pub(crate) fn open_image(path: &Path) -> Result<image::DynamicImage, VisionError> {
    image::open(path).map_err(|source| VisionError::Decode {
        path: path.to_path_buf(),
        source,
    })
}
