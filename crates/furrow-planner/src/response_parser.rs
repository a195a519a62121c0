//! Turns semi-structured model output into typed sections.
//!
//! Two shapes are accepted:
//!
//! * A JSON object (optionally wrapped in a ```` ```json ```` fence), whose
//!   top-level keys become sections.
//! * Free text where a header line (a short `Key:` label alone on its line)
//!   starts a section and following lines continue it. Inline `Key: value`
//!   lines are content, so dialogue such as `Pierre: Welcome!` stays intact.
//!   Inside an open section a bare label only starts a new section when it
//!   names a known response field or follows a blank line, so speaker labels
//!   in a transcript stay in the transcript. A section that appears twice is
//!   continued, not replaced. Text before the first header is kept as the
//!   preamble.
//!
//! Markdown emphasis (`**`) and heading markers (`#`) are ignored. Section
//! keys are lowercased with spaces turned into underscores, so
//! `**Task guidance:**` becomes `task_guidance`.

use furrow_providers::value_text;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::frame_index::{DIALOGUE, TASK_GUIDANCE};
use crate::gathering::{DESCRIPTION, OBJECTS, TARGET_OBJECT_NAME};

/// A label of at most four words followed by a colon, alone on its line
static HEADER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([A-Za-z][A-Za-z0-9_-]*(?:\s+[A-Za-z0-9_-]+){0,3})\s*:$")
        .expect("header pattern is valid")
});

/// Section keys the prompts ask for
const RESPONSE_FIELDS: [&str; 12] = [
    DESCRIPTION,
    OBJECTS,
    TARGET_OBJECT_NAME,
    DIALOGUE,
    TASK_GUIDANCE,
    "number",
    "actions",
    "reasoning",
    "success",
    "criticism",
    "reflection",
    "task_description",
];

/// A response that cannot be turned into sections
#[derive(Debug, Clone, Error, PartialEq)]
pub enum MalformedResponse {
    #[error("invalid JSON response: {0}")]
    InvalidJson(String),

    #[error("JSON response is not an object")]
    NotAnObject,

    #[error("unclosed code fence")]
    UnclosedFence,
}

/// One typed piece of a response. Preamble text has no kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub kind: Option<String>,
    pub value: Value,
}

impl Fact {
    /// Value as text; non-string JSON is rendered compactly
    pub fn text(&self) -> String {
        value_text(&self.value)
    }
}

/// Sections of one response, in the order they appeared
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedResponse {
    pub preamble: Option<String>,
    sections: Vec<(String, Value)>,
}

impl ParsedResponse {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.sections
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Section as text, if present
    pub fn text(&self, key: &str) -> Option<String> {
        self.get(key).map(value_text)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.sections.iter().map(|(k, _)| k.as_str())
    }

    /// True when there is neither preamble nor any section
    pub fn is_empty(&self) -> bool {
        self.preamble.is_none() && self.sections.is_empty()
    }

    /// Preamble (untyped) followed by every section as a typed fact
    pub fn facts(&self) -> Vec<Fact> {
        let mut facts = Vec::with_capacity(self.sections.len() + 1);
        if let Some(preamble) = &self.preamble {
            facts.push(Fact {
                kind: None,
                value: Value::String(preamble.clone()),
            });
        }
        facts.extend(self.sections.iter().map(|(k, v)| Fact {
            kind: Some(k.clone()),
            value: v.clone(),
        }));
        facts
    }

    /// Items of a list-like section: a JSON array, or comma/newline separated text
    pub fn list(&self, key: &str) -> Vec<String> {
        match self.get(key) {
            Some(Value::Array(items)) => items
                .iter()
                .map(value_text)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            Some(other) => value_text(other)
                .split([',', '\n'])
                .map(|s| s.trim().trim_start_matches(['-', '*']).trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Add a JSON section; a key seen before is replaced
    fn set(&mut self, key: String, value: Value) {
        match self.sections.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => {
                debug!("Section '{}' repeated in JSON response, keeping the later value", key);
                *existing = value;
            }
            None => self.sections.push((key, value)),
        }
    }

    /// Add a text section; a key seen before gets the new text appended
    fn append(&mut self, key: String, text: String) {
        match self.sections.iter_mut().find(|(k, _)| *k == key) {
            Some((_, Value::String(existing))) => {
                if !text.is_empty() {
                    if !existing.is_empty() {
                        existing.push('\n');
                    }
                    existing.push_str(&text);
                }
            }
            Some((_, existing)) => *existing = Value::String(text),
            None => self.sections.push((key, Value::String(text))),
        }
    }
}

fn header_key(line: &str) -> Option<String> {
    HEADER.captures(line).map(|caps| normalize_key(&caps[1]))
}

fn is_response_field(key: &str) -> bool {
    RESPONSE_FIELDS.contains(&key)
}

fn normalize_key(raw: &str) -> String {
    raw.trim().to_lowercase().replace([' ', '-'], "_")
}

fn strip_markdown(line: &str) -> String {
    line.replace("**", "")
        .trim_start_matches('#')
        .trim()
        .to_string()
}

/// Parse one model response
pub fn parse(text: &str) -> Result<ParsedResponse, MalformedResponse> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(ParsedResponse::default());
    }

    if let Some(json) = json_body(trimmed) {
        return parse_json(json);
    }

    if trimmed.matches("```").count() % 2 != 0 {
        return Err(MalformedResponse::UnclosedFence);
    }

    parse_sections(trimmed)
}

/// The JSON text if the response is a JSON object, possibly fenced
fn json_body(text: &str) -> Option<&str> {
    if text.starts_with('{') {
        return Some(text);
    }
    let inner = text
        .strip_prefix("```json")
        .or_else(|| text.strip_prefix("```"))?
        .trim_start();
    if !inner.starts_with('{') {
        return None;
    }
    Some(inner.strip_suffix("```").unwrap_or(inner).trim())
}

fn parse_json(json: &str) -> Result<ParsedResponse, MalformedResponse> {
    let value: Value =
        serde_json::from_str(json).map_err(|e| MalformedResponse::InvalidJson(e.to_string()))?;
    let Value::Object(map) = value else {
        return Err(MalformedResponse::NotAnObject);
    };

    let mut parsed = ParsedResponse::default();
    for (key, value) in map {
        parsed.set(normalize_key(&key), value);
    }
    Ok(parsed)
}

fn parse_sections(text: &str) -> Result<ParsedResponse, MalformedResponse> {
    let mut parsed = ParsedResponse::default();
    let mut current: Option<(String, Vec<String>)> = None;
    let mut preamble: Vec<String> = Vec::new();
    let mut in_code = false;
    let mut after_blank = true;

    let finish = |parsed: &mut ParsedResponse, section: Option<(String, Vec<String>)>| {
        if let Some((key, lines)) = section {
            parsed.append(key, lines.join("\n").trim().to_string());
        }
    };

    for raw_line in text.lines() {
        let fence = raw_line.trim_start().starts_with("```");
        if fence {
            in_code = !in_code;
        }

        let line = if in_code || fence {
            raw_line.trim_end().to_string()
        } else {
            strip_markdown(raw_line)
        };

        let header = if in_code {
            None
        } else {
            header_key(&line)
                .filter(|key| current.is_none() || after_blank || is_response_field(key))
        };
        after_blank = line.trim().is_empty();

        match header {
            Some(key) => {
                finish(&mut parsed, current.take());
                current = Some((key, Vec::new()));
            }
            None => match current.as_mut() {
                Some((_, lines)) => lines.push(line),
                None => preamble.push(line),
            },
        }
    }
    finish(&mut parsed, current.take());

    let preamble = preamble.join("\n").trim().to_string();
    if !preamble.is_empty() {
        parsed.preamble = Some(preamble);
    }
    Ok(parsed)
}
