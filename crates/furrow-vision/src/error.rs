use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VisionError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to decode image {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("Icon catalog directory not found: {0}")]
    CatalogNotFound(PathBuf),

    #[error("Selection region starts outside a {width}x{height} image")]
    RegionOutOfBounds { width: u32, height: u32 },
}
