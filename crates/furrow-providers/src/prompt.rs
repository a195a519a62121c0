//! Prompt assembly: `<$key$>` placeholder substitution plus image attachments.

use anyhow::{Context, Result};
use base64::Engine;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::{CompletionRequest, ImageContent, Message, MessageRole};

/// Key under which input documents carry their image list
pub const IMAGE_INTRODUCTION_KEY: &str = "image_introduction";

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<\$(\w+)\$>").expect("placeholder pattern is valid"));

/// One image attached to a prompt, introduced by a line of text and optionally
/// followed by a canned assistant turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageIntroduction {
    #[serde(default)]
    pub introduction: String,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub assistant: String,
}

/// Parameters substituted into a template
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptParams {
    #[serde(flatten)]
    pub values: BTreeMap<String, Value>,
    #[serde(rename = "image_introduction", default)]
    pub images: Vec<ImageIntroduction>,
}

impl PromptParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build parameters from a JSON input document
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value).context("input document is not a parameter object")
    }

    /// Builder: set a text value
    pub fn with_value(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.values.insert(key.to_string(), value.into());
        self
    }

    /// Builder: append an image
    pub fn with_image(mut self, introduction: &str, path: impl Into<PathBuf>) -> Self {
        self.images.push(ImageIntroduction {
            introduction: introduction.to_string(),
            path: Some(path.into()),
            assistant: String::new(),
        });
        self
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.values.insert(key.to_string(), value.into());
    }

    /// Copy of these parameters with the last image pointing at `path`.
    ///
    /// The introduction and assistant text of the last image are kept; if there
    /// are no images one is appended.
    pub fn with_last_image(&self, path: &Path) -> Self {
        let mut params = self.clone();
        match params.images.last_mut() {
            Some(last) => last.path = Some(path.to_path_buf()),
            None => params.images.push(ImageIntroduction {
                introduction: String::new(),
                path: Some(path.to_path_buf()),
                assistant: String::new(),
            }),
        }
        params
    }

    /// Path of the first attached image, if any
    pub fn first_image_path(&self) -> Option<&Path> {
        self.images.iter().find_map(|i| i.path.as_deref())
    }
}

/// Text for a value; strings are used as-is, anything else as compact JSON
pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Substitute `<$key$>` placeholders in `template` and attach images.
///
/// The substituted template becomes the system message. Each image becomes a
/// user message carrying its introduction and base64 payload, followed by an
/// assistant message when the introduction has canned assistant text. An image
/// without a path contributes only its introduction.
pub fn assemble_prompt(template: &str, params: &PromptParams) -> Result<CompletionRequest> {
    let mut messages = vec![Message::new(
        MessageRole::System,
        substitute(template, &params.values),
    )];

    for image in &params.images {
        let images = match &image.path {
            Some(path) => vec![load_image(path)?],
            None => Vec::new(),
        };
        messages.push(Message::with_images(
            MessageRole::User,
            image.introduction.clone(),
            images,
        ));
        if !image.assistant.is_empty() {
            messages.push(Message::new(MessageRole::Assistant, image.assistant.clone()));
        }
    }

    Ok(CompletionRequest {
        messages,
        max_tokens: None,
        temperature: None,
    })
}

fn substitute(template: &str, values: &BTreeMap<String, Value>) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| {
            let key = &caps[1];
            match values.get(key) {
                Some(value) => value_text(value),
                None => {
                    warn!("No value for placeholder <${}$>, substituting empty text", key);
                    String::new()
                }
            }
        })
        .into_owned()
}

/// Read an image file and encode it for a multimodal message
pub fn load_image(path: &Path) -> Result<ImageContent> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("failed to read image {}", path.display()))?;

    let media_type = ImageContent::media_type_from_bytes(&bytes)
        .or_else(|| {
            path.extension()
                .and_then(|e| e.to_str())
                .and_then(ImageContent::media_type_from_extension)
        })
        .unwrap_or("image/png");

    let data = base64::engine::general_purpose::STANDARD.encode(&bytes);
    Ok(ImageContent::new(media_type, data))
}
