use image::imageops::FilterType;
use image::GrayImage;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::{open_image, VisionError};

/// Side length of the normalised thumbnails icons are compared at
pub const THUMBNAIL_SIZE: u32 = 32;

const ICON_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// One icon template
#[derive(Debug, Clone)]
pub struct Icon {
    /// File stem of the template, used as the item name
    pub name: String,
    pub path: PathBuf,
    pub thumbnail: GrayImage,
}

/// The set of icon templates slot screenshots are matched against
#[derive(Debug, Clone, Default)]
pub struct IconCatalog {
    icons: Vec<Icon>,
}

impl IconCatalog {
    /// Load every image in `dir`, ordered by file name.
    ///
    /// Files that fail to decode are skipped with a warning.
    pub fn load(dir: &Path) -> Result<Self, VisionError> {
        if !dir.is_dir() {
            return Err(VisionError::CatalogNotFound(dir.to_path_buf()));
        }

        let entries = std::fs::read_dir(dir).map_err(|source| VisionError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .map(|e| ICON_EXTENSIONS.contains(&e.to_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .collect();
        paths.sort();

        let mut icons = Vec::with_capacity(paths.len());
        for path in paths {
            let Some(name) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            match open_image(&path) {
                Ok(img) => icons.push(Icon {
                    name,
                    thumbnail: thumbnail(&img),
                    path,
                }),
                Err(e) => warn!("Skipping icon template: {}", e),
            }
        }

        debug!("Loaded {} icon templates from {}", icons.len(), dir.display());
        Ok(Self { icons })
    }

    /// Build a catalog from already decoded images
    pub fn from_images(images: Vec<(String, image::DynamicImage)>) -> Self {
        let icons = images
            .into_iter()
            .map(|(name, img)| Icon {
                path: PathBuf::from(&name),
                thumbnail: thumbnail(&img),
                name,
            })
            .collect();
        Self { icons }
    }

    pub fn icons(&self) -> &[Icon] {
        &self.icons
    }

    pub fn len(&self) -> usize {
        self.icons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.icons.is_empty()
    }
}

/// Grayscale, fixed-size rendition used for comparison
pub fn thumbnail(img: &image::DynamicImage) -> GrayImage {
    image::imageops::resize(
        &img.to_luma8(),
        THUMBNAIL_SIZE,
        THUMBNAIL_SIZE,
        FilterType::Triangle,
    )
}
