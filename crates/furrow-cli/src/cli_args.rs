//! CLI argument parsing for furrow.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use furrow_planner::FrameRef;

#[derive(Parser, Clone, Debug)]
#[command(name = "furrow")]
#[command(about = "Perception and planning stages for a farming-game agent")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Override the configured provider (e.g., 'openai.default')
    #[arg(long, value_name = "PROVIDER", global = true)]
    pub provider: Option<String>,

    /// Override the model for the selected provider
    #[arg(long, value_name = "MODEL", global = true)]
    pub model: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Gather an observation from screenshots and frames and print it as JSON
    Gather {
        /// Toolbar slot screenshot, repeated left to right
        #[arg(long = "toolbar", value_name = "PATH")]
        toolbar: Vec<PathBuf>,

        /// Video frame with its timestamp, repeated
        #[arg(long = "frame", value_name = "PATH@SECONDS", value_parser = parse_frame)]
        frames: Vec<FrameRef>,

        /// Name of the recording the frames came from
        #[arg(long, default_value = "frames")]
        source: String,

        /// Screenshot for the scene description and object detection
        #[arg(long, value_name = "PATH")]
        scene: Option<PathBuf>,

        /// Task description known before this run
        #[arg(long, value_name = "TEXT")]
        task: Option<String>,

        /// Query frames one at a time instead of concurrently
        #[arg(long)]
        sequential: bool,
    },

    /// Run one single-shot stage and print its result as JSON
    Stage {
        /// action_planning, success_detection, self_reflection or task_inference
        name: String,

        /// JSON parameter document (defaults to the configured input for the stage)
        #[arg(long, value_name = "PATH")]
        input: Option<PathBuf>,
    },
}

/// Parse `PATH@SECONDS`; the last `@` separates the timestamp
pub fn parse_frame(value: &str) -> Result<FrameRef, String> {
    let (path, seconds) = value
        .rsplit_once('@')
        .ok_or_else(|| format!("expected PATH@SECONDS, got '{}'", value))?;
    if path.is_empty() {
        return Err(format!("missing frame path in '{}'", value));
    }
    let timestamp: f64 = seconds
        .parse()
        .map_err(|_| format!("invalid timestamp '{}' in '{}'", seconds, value))?;
    if !timestamp.is_finite() || timestamp < 0.0 {
        return Err(format!("timestamp must be a non-negative number, got {}", seconds));
    }
    Ok(FrameRef::new(path, timestamp))
}
