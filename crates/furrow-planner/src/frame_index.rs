//! Timestamp-keyed store of per-frame facts, rebuilt for every gathering run.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use tracing::warn;

use crate::errors::PlannerError;
use crate::response_parser::Fact;
use furrow_config::DuplicatePolicy;

/// Fact type carrying on-screen dialogue
pub const DIALOGUE: &str = "dialogue";
/// Fact type carrying the in-game task hint
pub const TASK_GUIDANCE: &str = "task_guidance";
/// Marker the model uses for "no task" / "no target"
pub const NONE_MARKER: &str = "none";

/// Identifies one frame: the source it came from plus its timestamp in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameKey {
    pub video_prefix: String,
    pub timestamp: f64,
}

impl FrameKey {
    pub fn new(video_prefix: impl Into<String>, timestamp: f64) -> Self {
        Self {
            video_prefix: video_prefix.into(),
            timestamp,
        }
    }
}

// Ordered by timestamp, then prefix
impl Ord for FrameKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .total_cmp(&other.timestamp)
            .then_with(|| self.video_prefix.cmp(&other.video_prefix))
    }
}

impl PartialOrd for FrameKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for FrameKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FrameKey {}

impl fmt::Display for FrameKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.video_prefix, self.timestamp)
    }
}

/// Facts extracted from one frame's response, in response order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameRecord {
    pub facts: Vec<Fact>,
}

impl FrameRecord {
    pub fn new(facts: Vec<Fact>) -> Self {
        Self { facts }
    }
}

/// A fact found by type, with the frame it came from
#[derive(Debug, Clone, PartialEq)]
pub struct TypedFact {
    pub key: FrameKey,
    pub value: Value,
}

impl TypedFact {
    pub fn text(&self) -> String {
        furrow_providers::value_text(&self.value)
    }
}

#[derive(Debug, Clone, Default)]
pub struct FrameIndexStore {
    records: BTreeMap<FrameKey, FrameRecord>,
}

impl FrameIndexStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record, resolving an existing key according to `policy`
    pub fn insert(
        &mut self,
        key: FrameKey,
        record: FrameRecord,
        policy: DuplicatePolicy,
    ) -> Result<(), PlannerError> {
        if self.records.contains_key(&key) {
            match policy {
                DuplicatePolicy::Overwrite => {
                    warn!("Duplicate frame {}, replacing the earlier record", key);
                }
                DuplicatePolicy::Reject => return Err(PlannerError::DuplicateFrame(key)),
            }
        }
        self.records.insert(key, record);
        Ok(())
    }

    pub fn get(&self, key: &FrameKey) -> Option<&FrameRecord> {
        self.records.get(key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Keys by ascending timestamp, ties broken by prefix
    pub fn sorted_keys(&self) -> Vec<&FrameKey> {
        self.records.keys().collect()
    }

    /// Records in key order
    pub fn iter(&self) -> impl Iterator<Item = (&FrameKey, &FrameRecord)> {
        self.records.iter()
    }

    /// Every fact of `kind` across all records, in key order
    pub fn search_type(&self, kind: &str) -> Vec<TypedFact> {
        self.records
            .iter()
            .flat_map(|(key, record)| {
                record
                    .facts
                    .iter()
                    .filter(move |f| f.kind.as_deref() == Some(kind))
                    .map(move |f| TypedFact {
                        key: key.clone(),
                        value: f.value.clone(),
                    })
            })
            .collect()
    }

    /// Latest task guidance that is not a "none" placeholder
    pub fn latest_task_guidance(&self) -> Option<String> {
        self.search_type(TASK_GUIDANCE)
            .into_iter()
            .filter(|fact| !fact.text().to_lowercase().contains(NONE_MARKER))
            .max_by(|a, b| a.key.cmp(&b.key))
            .map(|fact| fact.text())
    }
}

/// Source disambiguator: file stem of `source`, last `_`-separated segment.
///
/// `clips/run_2024_07.mp4` gives `07`.
pub fn video_prefix(source: &str) -> String {
    let base = source
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(source);
    let stem = base.split('.').next().unwrap_or(base);
    stem.rsplit('_').next().unwrap_or(stem).to_string()
}
