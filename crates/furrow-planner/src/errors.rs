use std::path::PathBuf;
use thiserror::Error;

use crate::frame_index::FrameKey;

/// Returned when a gathering run is cancelled through its token
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("information gathering was cancelled")]
pub struct Cancelled;

#[derive(Debug, Error)]
pub enum PlannerError {
    #[error("Invalid planner configuration: {0}")]
    Config(String),

    #[error("Missing prompt template '{0}'")]
    MissingTemplate(String),

    #[error("Unknown stage '{0}'")]
    UnknownStage(String),

    #[error("Failed to load prompt resource {path}: {message}")]
    PromptLoad { path: PathBuf, message: String },

    #[error("Stage '{0}' is not enabled")]
    StageDisabled(&'static str),

    #[error("Frame {0} was already recorded")]
    DuplicateFrame(FrameKey),
}
