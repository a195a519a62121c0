//! The planner facade: named stage operations over one configuration.

use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use furrow_config::{Config, StageFlags};
use furrow_providers::{LLMProvider, OpenAIProvider, PromptParams};

use crate::errors::{Cancelled, PlannerError};
use crate::gathering::{
    Collaborators, FrameSource, GatherRequest, GatherSettings, GatherTemplates,
    InformationGatherer, Observation,
};
use crate::prompts::{
    PromptLibrary, ACTION_PLANNING, INFORMATION_GATHERING, INFORMATION_TEXT_GATHERING,
    INFORMATION_TOOLBAR_GATHERING, SELF_REFLECTION, SUCCESS_DETECTION, TASK_INFERENCE,
};
use crate::stage::{StageOutcome, StageRunner};

/// Create the model backend named by `default_provider`
pub fn create_provider(config: &Config) -> Result<Arc<dyn LLMProvider>> {
    let (provider_type, _) = Config::parse_provider_reference(&config.providers.default_provider)?;
    match provider_type.as_str() {
        "openai" => {
            let (config_name, openai_config) = config.get_default_provider_config()?;
            if openai_config.api_key.is_empty() {
                warn!("OpenAI config '{}' has an empty api_key", config_name);
            }
            let provider = OpenAIProvider::new_with_name(
                format!("openai.{}", config_name),
                openai_config.api_key.clone(),
                Some(openai_config.model.clone()),
                openai_config.base_url.clone(),
                openai_config.max_tokens,
                openai_config.temperature,
                openai_config.timeout_seconds,
            )
            .context("Failed to create OpenAI provider")?;
            Ok(Arc::new(provider))
        }
        other => Err(anyhow!(
            "Unsupported provider type '{}'. Supported: openai",
            other
        )),
    }
}

pub struct Planner {
    library: PromptLibrary,
    stages: StageFlags,
    max_steps: u32,
    gatherer: InformationGatherer,
    action_planning: StageRunner,
    success_detection: StageRunner,
    self_reflection: Option<StageRunner>,
    task_inference: Option<StageRunner>,
}

impl Planner {
    /// Load prompt resources from the configured paths and build every
    /// enabled stage. Any missing or unreadable resource is an error.
    pub fn new(
        config: &Config,
        provider: Arc<dyn LLMProvider>,
        collaborators: Collaborators,
    ) -> Result<Self, PlannerError> {
        let library =
            PromptLibrary::load(&config.planner.prompt_paths, &config.required_templates())?;
        Self::with_library(config, library, provider, collaborators)
    }

    /// Build from already loaded prompt resources
    pub fn with_library(
        config: &Config,
        library: PromptLibrary,
        provider: Arc<dyn LLMProvider>,
        collaborators: Collaborators,
    ) -> Result<Self, PlannerError> {
        if config.planner.gather_information_max_steps == 0 {
            return Err(PlannerError::Config(
                "gather_information_max_steps must be at least 1".to_string(),
            ));
        }
        library.require(&config.required_templates())?;

        let templates = GatherTemplates {
            scene: library.template(INFORMATION_GATHERING)?.to_string(),
            frame_text: library.template(INFORMATION_TEXT_GATHERING)?.to_string(),
            toolbar: library.template(INFORMATION_TOOLBAR_GATHERING)?.to_string(),
        };
        let gatherer = InformationGatherer::new(
            provider.clone(),
            templates,
            GatherSettings::from_config(&config.gathering),
            collaborators,
        );

        let stage = |name: &str| -> Result<StageRunner, PlannerError> {
            Ok(StageRunner::new(name, library.template(name)?, provider.clone()))
        };
        let action_planning = stage(ACTION_PLANNING)?;
        let success_detection = stage(SUCCESS_DETECTION)?;
        let self_reflection = if config.planner.use_self_reflection {
            Some(stage(SELF_REFLECTION)?)
        } else {
            None
        };
        let task_inference = if config.planner.use_task_inference {
            Some(stage(TASK_INFERENCE)?)
        } else {
            None
        };

        info!(
            "Planner ready with {} (self reflection: {}, task inference: {})",
            provider.name(),
            self_reflection.is_some(),
            task_inference.is_some()
        );

        Ok(Self {
            library,
            stages: config.gathering.stages,
            max_steps: config.planner.gather_information_max_steps,
            gatherer,
            action_planning,
            success_detection,
            self_reflection,
            task_inference,
        })
    }

    /// A gathering request with the configured stage flags and the default
    /// input documents, for the caller to fill in screenshots and frames
    pub fn gather_request(&self) -> GatherRequest {
        GatherRequest {
            stages: self.stages,
            toolbar_screenshots: Vec::new(),
            frames: FrameSource::None,
            scene_params: self.library.input(INFORMATION_GATHERING),
            frame_params: self.library.input(INFORMATION_TEXT_GATHERING),
            toolbar_params: self.library.input(INFORMATION_TOOLBAR_GATHERING),
            previous_task: None,
        }
    }

    /// Gather up to `gather_information_max_steps` times, stopping at the
    /// first successful observation. The last observation is returned either way.
    pub async fn information_gathering(
        &self,
        request: Option<GatherRequest>,
        cancel: &CancellationToken,
    ) -> Result<Observation, Cancelled> {
        let request = request.unwrap_or_else(|| self.gather_request());

        let mut step = 1;
        loop {
            let observation = self.gatherer.gather(request.clone(), cancel).await?;
            if observation.success || step >= self.max_steps {
                return Ok(observation);
            }
            warn!(
                "Information gathering step {}/{} did not succeed, trying again",
                step, self.max_steps
            );
            step += 1;
        }
    }

    pub async fn action_planning(&self, params: Option<PromptParams>) -> StageOutcome {
        let params = params.unwrap_or_else(|| self.library.input(ACTION_PLANNING));
        self.action_planning.run(&params).await
    }

    pub async fn success_detection(&self, params: Option<PromptParams>) -> StageOutcome {
        let params = params.unwrap_or_else(|| self.library.input(SUCCESS_DETECTION));
        self.success_detection.run(&params).await
    }

    pub async fn self_reflection(
        &self,
        params: Option<PromptParams>,
    ) -> Result<StageOutcome, PlannerError> {
        let runner = self
            .self_reflection
            .as_ref()
            .ok_or(PlannerError::StageDisabled(SELF_REFLECTION))?;
        let params = params.unwrap_or_else(|| self.library.input(SELF_REFLECTION));
        Ok(runner.run(&params).await)
    }

    pub async fn task_inference(
        &self,
        params: Option<PromptParams>,
    ) -> Result<StageOutcome, PlannerError> {
        let runner = self
            .task_inference
            .as_ref()
            .ok_or(PlannerError::StageDisabled(TASK_INFERENCE))?;
        let params = params.unwrap_or_else(|| self.library.input(TASK_INFERENCE));
        Ok(runner.run(&params).await)
    }

    /// Run a single-shot stage by name
    pub async fn run_stage(
        &self,
        name: &str,
        params: Option<PromptParams>,
    ) -> Result<StageOutcome, PlannerError> {
        match name {
            ACTION_PLANNING => Ok(self.action_planning(params).await),
            SUCCESS_DETECTION => Ok(self.success_detection(params).await),
            SELF_REFLECTION => self.self_reflection(params).await,
            TASK_INFERENCE => self.task_inference(params).await,
            other => Err(PlannerError::UnknownStage(other.to_string())),
        }
    }
}
