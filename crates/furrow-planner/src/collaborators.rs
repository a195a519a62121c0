//! Interfaces to the perception services gathering relies on but does not own.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

/// One extracted frame: the image on disk and its timestamp in seconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameRef {
    pub path: PathBuf,
    pub timestamp: f64,
}

impl FrameRef {
    pub fn new(path: impl Into<PathBuf>, timestamp: f64) -> Self {
        Self {
            path: path.into(),
            timestamp,
        }
    }
}

/// Samples key frames from a video
#[async_trait]
pub trait FrameExtractor: Send + Sync {
    /// Ordered `(frame, timestamp)` pairs for the video at `source`
    async fn extract(&self, source: &Path) -> Result<Vec<FrameRef>>;
}

/// Frames after icon replacement plus the objects the replacer recognised
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IconReplacement {
    /// Same length and order as the input
    pub frame_paths: Vec<PathBuf>,
    pub objects: Vec<String>,
}

/// Rewrites in-game icons in frames into a form the model reads more reliably
#[async_trait]
pub trait IconReplacer: Send + Sync {
    async fn replace(&self, frame_paths: &[PathBuf]) -> Result<IconReplacement>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// `[x0, y0, x1, y1]` per detected object
    pub boxes: Vec<[f32; 4]>,
    pub scores: Vec<f32>,
    pub labels: Vec<String>,
}

/// Open-vocabulary object detector over screenshots
#[async_trait]
pub trait ObjectDetector: Send + Sync {
    async fn detect(
        &self,
        image: &Path,
        prompt: &str,
        box_threshold: f32,
        device: &str,
    ) -> Result<Detection>;

    /// Objects shown on the minimap, as JSON
    async fn detect_minimap(&self, image: &Path) -> Result<Value>;
}
