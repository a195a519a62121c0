//! furrow-planner: perception and decision stages for a farming-game agent
//!
//! Information gathering turns screenshots and video frames into an
//! [`Observation`] by querying a model backend many times concurrently, while
//! the single-shot stages (action planning, success detection, self
//! reflection, task inference) make exactly one call each. [`Planner`] exposes
//! all of them as named operations over one loaded configuration.

pub mod collaborators;
pub mod error_handling;
pub mod errors;
pub mod frame_index;
pub mod gathering;
pub mod planner;
pub mod prompts;
pub mod response_parser;
pub mod retry;
pub mod stage;
pub mod toolbar;

pub use collaborators::{
    Detection, FrameExtractor, FrameRef, IconReplacement, IconReplacer, ObjectDetector,
};
pub use errors::{Cancelled, PlannerError};
pub use frame_index::{FrameIndexStore, FrameKey, FrameRecord, TypedFact};
pub use gathering::{
    Collaborators, FrameSource, GatherRequest, GatherSettings, GatherTemplates,
    InformationGatherer, Observation,
};
pub use planner::{create_provider, Planner};
pub use prompts::PromptLibrary;
pub use response_parser::{parse, MalformedResponse, ParsedResponse};
pub use retry::{RetryDelay, RetryPolicy};
pub use stage::{StageOutcome, StageRunner};
pub use toolbar::{ToolbarEntry, ToolbarSnapshot};
