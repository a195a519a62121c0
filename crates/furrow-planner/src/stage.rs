//! Single-shot stages: one prompt, one model call, one parse.

use std::sync::Arc;
use tracing::{debug, error, info, warn};

use furrow_providers::{assemble_prompt, LLMProvider, PromptParams};

use crate::error_handling::truncate_for_logging;
use crate::response_parser::{self, ParsedResponse};

/// Result of one stage call. `result` is empty whenever `flag` is false.
#[derive(Debug, Clone, Default)]
pub struct StageOutcome {
    pub flag: bool,
    pub result: ParsedResponse,
}

/// Runs a reasoning stage such as action planning or success detection.
///
/// Unlike information gathering there is no retry: a failed call or an
/// unparseable answer ends the stage with `flag = false`.
pub struct StageRunner {
    name: String,
    template: String,
    provider: Arc<dyn LLMProvider>,
}

impl StageRunner {
    pub fn new(name: impl Into<String>, template: impl Into<String>, provider: Arc<dyn LLMProvider>) -> Self {
        Self {
            name: name.into(),
            template: template.into(),
            provider,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn run(&self, params: &PromptParams) -> StageOutcome {
        info!("Running {} stage", self.name);

        let request = match assemble_prompt(&self.template, params) {
            Ok(request) => request,
            Err(e) => {
                error!("Error in {}: failed to assemble prompt: {:#}", self.name, e);
                return StageOutcome::default();
            }
        };
        debug!("Upstream {}: {}", self.name, truncate_for_logging(&request.text(), 2000));

        let response = match self.provider.complete(request).await {
            Ok(response) => response,
            Err(e) => {
                error!("Error in {}: {:#}", self.name, e);
                return StageOutcome::default();
            }
        };
        debug!("Downstream {}: {}", self.name, truncate_for_logging(&response.content, 2000));

        if response.content.trim().is_empty() {
            warn!("No response in {} call", self.name);
        }

        match response_parser::parse(&response.content) {
            Ok(result) => StageOutcome { flag: true, result },
            Err(e) => {
                error!("Error in {}: {}", self.name, e);
                StageOutcome::default()
            }
        }
    }
}
