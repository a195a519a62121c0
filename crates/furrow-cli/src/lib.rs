//! furrow-cli: command line front end for information gathering and the
//! single-shot planning stages.

pub mod cli_args;
pub mod report;
pub mod utils;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use furrow_config::Config;
use furrow_planner::{
    create_provider, Cancelled, Collaborators, FrameRef, FrameSource, Planner, PlannerError,
};
use furrow_providers::{LLMProvider, PromptParams};
use furrow_vision::{IconCatalog, PixelTemplateMatcher};

use cli_args::{Cli, Command};
use utils::initialize_logging;

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    initialize_logging(cli.verbose);

    let config = Config::load_with_overrides(
        cli.config.as_deref(),
        cli.provider.clone(),
        cli.model.clone(),
    )
    .context("Failed to load configuration")?;
    let provider = create_provider(&config)?;
    info!("Using provider {} ({})", provider.name(), provider.model());

    match cli.command {
        Command::Gather {
            toolbar,
            frames,
            source,
            scene,
            task,
            sequential,
        } => {
            let options = GatherOptions {
                toolbar,
                frames,
                source,
                scene,
                task,
                sequential,
            };
            run_gather(config, provider, options).await
        }
        Command::Stage { name, input } => run_stage(&config, provider, &name, input.as_deref()).await,
    }
}

struct GatherOptions {
    toolbar: Vec<PathBuf>,
    frames: Vec<FrameRef>,
    source: String,
    scene: Option<PathBuf>,
    task: Option<String>,
    sequential: bool,
}

async fn run_gather(
    mut config: Config,
    provider: Arc<dyn LLMProvider>,
    options: GatherOptions,
) -> Result<()> {
    if options.sequential {
        config.gathering.parallel_requests = false;
    }
    let collaborators = Collaborators::from_config(&config.gathering)
        .context("Failed to load the toolbar icon catalog")?;
    let planner = Planner::new(&config, provider, collaborators)?;

    let mut request = planner.gather_request();
    request.toolbar_screenshots = options.toolbar;
    request.previous_task = options.task;
    if !options.frames.is_empty() {
        request.frames = FrameSource::Frames {
            source_id: options.source,
            frames: options.frames,
        };
    }
    if let Some(scene) = &options.scene {
        request.scene_params = request.scene_params.with_last_image(scene);
    }

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl+C received, cancelling information gathering");
            trigger.cancel();
        }
    });

    match planner.information_gathering(Some(request), &cancel).await {
        Ok(observation) => {
            let report = report::observation_json(&observation);
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Err(Cancelled) => {
            println!("⚠️  Information gathering cancelled by user (Ctrl+C)");
            Ok(())
        }
    }
}

async fn run_stage(
    config: &Config,
    provider: Arc<dyn LLMProvider>,
    name: &str,
    input: Option<&Path>,
) -> Result<()> {
    // Stages never touch the toolbar, so an empty catalog is enough
    let collaborators = Collaborators::new(
        Arc::new(PixelTemplateMatcher::new(config.gathering.match_threshold)),
        IconCatalog::default(),
    );
    let planner = Planner::new(config, provider, collaborators)?;

    let params = match input {
        Some(path) => Some(read_params(path)?),
        None => None,
    };

    match planner.run_stage(name, params).await {
        Ok(outcome) => {
            let report = report::stage_json(name, &outcome);
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Err(PlannerError::UnknownStage(stage)) => Err(anyhow::anyhow!(
            "Unknown stage '{}'. Supported: action_planning, success_detection, self_reflection, task_inference",
            stage
        )),
        Err(e) => Err(e.into()),
    }
}

fn read_params(path: &Path) -> Result<PromptParams> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let value = serde_json::from_str(&content)
        .with_context(|| format!("{} is not valid JSON", path.display()))?;
    PromptParams::from_value(value)
}
