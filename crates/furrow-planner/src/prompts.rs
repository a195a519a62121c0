//! Prompt templates and default input documents, loaded once at planner setup.
//!
//! A resource whose path ends in `.prompt` is template text; anything else is
//! read as a JSON parameter document.

use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use tracing::debug;

use furrow_config::PromptPaths;
use furrow_providers::PromptParams;

use crate::errors::PlannerError;

const PROMPT_EXT: &str = ".prompt";

/// Names under which gathering looks up its templates and inputs
pub const INFORMATION_GATHERING: &str = "information_gathering";
pub const INFORMATION_TEXT_GATHERING: &str = "information_text_gathering";
pub const INFORMATION_TOOLBAR_GATHERING: &str = "information_toolbar_gathering";
pub const ACTION_PLANNING: &str = "action_planning";
pub const SUCCESS_DETECTION: &str = "success_detection";
pub const SELF_REFLECTION: &str = "self_reflection";
pub const TASK_INFERENCE: &str = "task_inference";

#[derive(Debug, Clone, PartialEq)]
pub enum PromptResource {
    Text(String),
    Json(Value),
}

impl PromptResource {
    pub fn load(path: &str) -> Result<Self, PlannerError> {
        let content = fs::read_to_string(path).map_err(|e| PlannerError::PromptLoad {
            path: path.into(),
            message: e.to_string(),
        })?;

        if path.ends_with(PROMPT_EXT) {
            return Ok(Self::Text(content));
        }
        serde_json::from_str(&content)
            .map(Self::Json)
            .map_err(|e| PlannerError::PromptLoad {
                path: path.into(),
                message: e.to_string(),
            })
    }
}

#[derive(Debug, Clone, Default)]
pub struct PromptLibrary {
    templates: HashMap<String, String>,
    inputs: HashMap<String, PromptParams>,
}

impl PromptLibrary {
    /// Load every configured resource and check that each name in `required`
    /// has a text template.
    pub fn load(paths: &PromptPaths, required: &[&str]) -> Result<Self, PlannerError> {
        let mut library = Self::default();

        for (name, path) in &paths.templates {
            match PromptResource::load(path)? {
                PromptResource::Text(text) => {
                    library.templates.insert(name.clone(), text);
                }
                PromptResource::Json(_) => {
                    return Err(PlannerError::PromptLoad {
                        path: path.into(),
                        message: format!("template '{}' must be a {} file", name, PROMPT_EXT),
                    });
                }
            }
        }

        for (name, path) in &paths.inputs {
            let params = match PromptResource::load(path)? {
                PromptResource::Json(value) => {
                    PromptParams::from_value(value).map_err(|e| PlannerError::PromptLoad {
                        path: path.into(),
                        message: format!("{:#}", e),
                    })?
                }
                PromptResource::Text(text) => PromptParams::new().with_value("text", text),
            };
            library.inputs.insert(name.clone(), params);
        }

        library.require(required)?;
        debug!(
            "Loaded {} templates and {} input documents",
            library.templates.len(),
            library.inputs.len()
        );
        Ok(library)
    }

    pub fn with_template(mut self, name: &str, text: &str) -> Self {
        self.templates.insert(name.to_string(), text.to_string());
        self
    }

    pub fn with_input(mut self, name: &str, params: PromptParams) -> Self {
        self.inputs.insert(name.to_string(), params);
        self
    }

    pub fn require(&self, names: &[&str]) -> Result<(), PlannerError> {
        match names.iter().find(|name| !self.templates.contains_key(**name)) {
            Some(missing) => Err(PlannerError::MissingTemplate(missing.to_string())),
            None => Ok(()),
        }
    }

    pub fn template(&self, name: &str) -> Result<&str, PlannerError> {
        self.templates
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| PlannerError::MissingTemplate(name.to_string()))
    }

    /// Default parameters for `name`; empty when no input document was configured
    pub fn input(&self, name: &str) -> PromptParams {
        self.inputs.get(name).cloned().unwrap_or_default()
    }

    pub fn has_input(&self, name: &str) -> bool {
        self.inputs.contains_key(name)
    }
}
