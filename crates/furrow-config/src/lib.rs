use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Templates every planner needs, by name
pub const REQUIRED_TEMPLATES: [&str; 5] = [
    "information_gathering",
    "information_text_gathering",
    "information_toolbar_gathering",
    "action_planning",
    "success_detection",
];

const LOCAL_CONFIG_PATH: &str = "./furrow.toml";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub providers: ProvidersConfig,
    pub gathering: GatheringConfig,
    #[serde(default)]
    pub planner: PlannerConfig,
}

/// Provider configuration with named configs per provider type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    /// Default provider in format "<provider_type>.<config_name>"
    pub default_provider: String,

    /// Named OpenAI-compatible provider configs
    #[serde(default)]
    pub openai: HashMap<String, OpenAIConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAIConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub timeout_seconds: Option<u64>,
}

/// What to do when a frame key is inserted twice in one gathering run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// Replace the earlier record and log a warning
    #[default]
    Overwrite,
    /// Keep the earlier record and report an error
    Reject,
}

/// Which parts of information gathering run. Every flag must be spelled out.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageFlags {
    pub frame_extraction: bool,
    pub icon_replacement: bool,
    pub object_detection: bool,
    pub item_counting: bool,
    pub scene_description: bool,
}

impl Default for StageFlags {
    fn default() -> Self {
        Self {
            frame_extraction: true,
            icon_replacement: false,
            object_detection: false,
            item_counting: true,
            scene_description: true,
        }
    }
}

/// Region of a slot screenshot inspected for the selection highlight.
/// Missing width/height extend to the image edge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SelectionBoxConfig {
    #[serde(default)]
    pub x: u32,
    #[serde(default)]
    pub y: u32,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Fraction of border pixels that must carry the highlight colour
    #[serde(default = "default_highlight_threshold")]
    pub highlight_threshold: f32,
}

fn default_highlight_threshold() -> f32 {
    0.5
}

impl Default for SelectionBoxConfig {
    fn default() -> Self {
        Self {
            x: 0,
            y: 0,
            width: None,
            height: None,
            highlight_threshold: default_highlight_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DetectorConfig {
    #[serde(default = "default_box_threshold")]
    pub box_threshold: f32,
    #[serde(default = "default_device")]
    pub device: String,
}

fn default_box_threshold() -> f32 {
    0.4
}

fn default_device() -> String {
    "cuda".to_string()
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            box_threshold: default_box_threshold(),
            device: default_device(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatheringConfig {
    /// Issue per-frame queries concurrently rather than one at a time
    #[serde(default = "default_true")]
    pub parallel_requests: bool,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Unbounded when unset
    pub retry_max_attempts: Option<u32>,
    /// Delay between the starts of consecutive per-frame and per-slot queries
    #[serde(default = "default_stagger_ms")]
    pub stagger_ms: u64,
    #[serde(default)]
    pub duplicate_policy: DuplicatePolicy,
    #[serde(default = "default_icon_catalog_dir")]
    pub icon_catalog_dir: String,
    /// Largest mean absolute grey-level difference (0..1) accepted as an icon match
    #[serde(default = "default_match_threshold")]
    pub match_threshold: f32,
    #[serde(default)]
    pub selection_box: SelectionBoxConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    pub stages: StageFlags,
}

fn default_true() -> bool {
    true
}

fn default_retry_backoff_ms() -> u64 {
    2000
}

fn default_stagger_ms() -> u64 {
    2000
}

fn default_icon_catalog_dir() -> String {
    "./res/icons".to_string()
}

fn default_match_threshold() -> f32 {
    0.15
}

impl Default for GatheringConfig {
    fn default() -> Self {
        Self {
            parallel_requests: true,
            retry_backoff_ms: default_retry_backoff_ms(),
            retry_max_attempts: None,
            stagger_ms: default_stagger_ms(),
            duplicate_policy: DuplicatePolicy::Overwrite,
            icon_catalog_dir: default_icon_catalog_dir(),
            match_threshold: default_match_threshold(),
            selection_box: SelectionBoxConfig::default(),
            detector: DetectorConfig::default(),
            stages: StageFlags::default(),
        }
    }
}

/// Where prompt templates (`.prompt`) and input documents (`.json`) live, by name
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PromptPaths {
    #[serde(default)]
    pub inputs: HashMap<String, String>,
    #[serde(default)]
    pub templates: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    #[serde(default)]
    pub use_task_inference: bool,
    #[serde(default)]
    pub use_self_reflection: bool,
    #[serde(default = "default_max_steps")]
    pub gather_information_max_steps: u32,
    #[serde(default)]
    pub prompt_paths: PromptPaths,
}

fn default_max_steps() -> u32 {
    1
}

impl Default for PlannerConfig {
    fn default() -> Self {
        let mut prompt_paths = PromptPaths::default();
        for name in REQUIRED_TEMPLATES {
            prompt_paths.templates.insert(
                name.to_string(),
                format!("./res/prompts/templates/{}.prompt", name),
            );
            prompt_paths
                .inputs
                .insert(name.to_string(), format!("./res/prompts/inputs/{}.json", name));
        }

        Self {
            use_task_inference: false,
            use_self_reflection: false,
            gather_information_max_steps: default_max_steps(),
            prompt_paths,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let mut openai_configs = HashMap::new();
        openai_configs.insert(
            "default".to_string(),
            OpenAIConfig {
                api_key: String::new(),
                model: "gpt-4o".to_string(),
                base_url: None,
                max_tokens: Some(1024),
                temperature: Some(0.0),
                timeout_seconds: Some(120),
            },
        );

        Self {
            providers: ProvidersConfig {
                default_provider: "openai.default".to_string(),
                openai: openai_configs,
            },
            gathering: GatheringConfig::default(),
            planner: PlannerConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from `config_path`, else the first existing default
    /// location (`./furrow.toml`, `~/.config/furrow/config.toml`), else defaults.
    ///
    /// An explicit path that does not exist is an error.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let config_path_to_load = match config_path {
            Some(path) => {
                let expanded = shellexpand::tilde(path).to_string();
                if !Path::new(&expanded).exists() {
                    anyhow::bail!("Config file not found: {}", path);
                }
                Some(expanded)
            }
            None => std::iter::once(PathBuf::from(LOCAL_CONFIG_PATH))
                .chain(Self::user_config_path())
                .find(|path| path.exists())
                .map(|path| path.to_string_lossy().to_string()),
        };

        let Some(path) = config_path_to_load else {
            return Ok(Self::default());
        };

        let config_content = std::fs::read_to_string(&path)?;
        let config = Self::from_toml_str(&config_content)
            .map_err(|e| anyhow::anyhow!("Invalid configuration in {}: {}", path, e))?;
        Ok(config)
    }

    /// Parse and validate configuration text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints serde cannot express
    pub fn validate(&self) -> Result<()> {
        self.validate_provider_reference(&self.providers.default_provider)?;

        if self.planner.gather_information_max_steps == 0 {
            anyhow::bail!("planner.gather_information_max_steps must be at least 1");
        }

        let g = &self.gathering;
        if !(0.0..=1.0).contains(&g.match_threshold) {
            anyhow::bail!(
                "gathering.match_threshold must be within 0..=1, got {}",
                g.match_threshold
            );
        }
        if !(0.0..=1.0).contains(&g.selection_box.highlight_threshold) {
            anyhow::bail!(
                "gathering.selection_box.highlight_threshold must be within 0..=1, got {}",
                g.selection_box.highlight_threshold
            );
        }
        if !(0.0..=1.0).contains(&g.detector.box_threshold) {
            anyhow::bail!(
                "gathering.detector.box_threshold must be within 0..=1, got {}",
                g.detector.box_threshold
            );
        }
        if g.retry_max_attempts == Some(0) {
            anyhow::bail!("gathering.retry_max_attempts must be at least 1 when set");
        }

        Ok(())
    }

    /// Validate a provider reference (format: "<provider_type>.<config_name>")
    fn validate_provider_reference(&self, reference: &str) -> Result<()> {
        let (provider_type, config_name) = Self::parse_provider_reference(reference)?;

        match provider_type.as_str() {
            "openai" => {
                if !self.providers.openai.contains_key(&config_name) {
                    anyhow::bail!(
                        "Provider config 'openai.{}' not found. Available: {:?}",
                        config_name,
                        self.providers.openai.keys().collect::<Vec<_>>()
                    );
                }
            }
            _ => {
                anyhow::bail!(
                    "Unknown provider type '{}'. Valid types: openai",
                    provider_type
                );
            }
        }

        Ok(())
    }

    /// Parse a provider reference into (provider_type, config_name)
    pub fn parse_provider_reference(reference: &str) -> Result<(String, String)> {
        let parts: Vec<&str> = reference.split('.').collect();
        if parts.len() != 2 {
            anyhow::bail!(
                "Invalid provider reference '{}'. Expected format: '<provider_type>.<config_name>'",
                reference
            );
        }
        Ok((parts[0].to_string(), parts[1].to_string()))
    }

    /// Load, then point the default provider and/or its model elsewhere
    pub fn load_with_overrides(
        config_path: Option<&str>,
        provider_override: Option<String>,
        model_override: Option<String>,
    ) -> Result<Self> {
        let mut config = Self::load(config_path)?;

        if let Some(provider) = provider_override {
            config.validate_provider_reference(&provider)?;
            config.providers.default_provider = provider;
        }

        if let Some(model) = model_override {
            let (_, config_name) =
                Self::parse_provider_reference(&config.providers.default_provider)?;
            match config.providers.openai.get_mut(&config_name) {
                Some(openai_config) => openai_config.model = model,
                None => {
                    return Err(anyhow::anyhow!(
                        "Provider config 'openai.{}' not found.",
                        config_name
                    ))
                }
            }
        }

        Ok(config)
    }

    /// Get the current default provider's name and config
    pub fn get_default_provider_config(&self) -> Result<(String, &OpenAIConfig)> {
        let (_, config_name) = Self::parse_provider_reference(&self.providers.default_provider)?;
        let config = self
            .providers
            .openai
            .get(&config_name)
            .ok_or_else(|| anyhow::anyhow!("OpenAI config '{}' not found", config_name))?;
        Ok((config_name, config))
    }

    /// Names of the templates this configuration needs loaded
    pub fn required_templates(&self) -> Vec<&'static str> {
        let mut names = REQUIRED_TEMPLATES.to_vec();
        if self.planner.use_self_reflection {
            names.push("self_reflection");
        }
        if self.planner.use_task_inference {
            names.push("task_inference");
        }
        names
    }

    /// User-level configuration file, `~/.config/furrow/config.toml`
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|mut path| {
            path.push(".config");
            path.push("furrow");
            path.push("config.toml");
            path
        })
    }
}
