use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

use furrow_vision::{IconCatalog, SelectionBox, TemplateMatcher};

/// Name given to a slot no catalog icon matches
pub const UNKNOWN_ITEM: &str = "unknown";

/// `Number: 12`, tolerating markdown emphasis around the label
static NUMBER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)number\s*\**\s*:[\s*]*(\d+)").expect("number pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolbarEntry {
    pub name: String,
    pub count: u32,
    /// 1-based, left to right
    pub slot_position: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolbarSnapshot {
    /// Ordered by slot
    pub entries: Vec<ToolbarEntry>,
    pub selected_position: Option<usize>,
}

impl ToolbarSnapshot {
    pub fn selected(&self) -> Option<&ToolbarEntry> {
        let position = self.selected_position?;
        self.entries.iter().find(|e| e.slot_position == position)
    }
}

/// Names per slot and the highlighted slot, before item counting
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolbarMatch {
    /// Index `i` holds slot `i + 1`
    pub names: Vec<String>,
    pub selected_position: Option<usize>,
}

/// Identify the item in each slot screenshot and the first selected slot.
///
/// A screenshot that cannot be read is named [`UNKNOWN_ITEM`] and counts as
/// not selected.
pub fn match_toolbar(
    matcher: &dyn TemplateMatcher,
    screenshots: &[PathBuf],
    catalog: &IconCatalog,
    region: &SelectionBox,
) -> ToolbarMatch {
    let mut names = Vec::with_capacity(screenshots.len());
    let mut selected_position = None;

    for (i, shot) in screenshots.iter().enumerate() {
        let name = match matcher.best_match(shot, catalog) {
            Ok(Some(found)) => found.name,
            Ok(None) => UNKNOWN_ITEM.to_string(),
            Err(e) => {
                warn!("Template matching failed for slot {}: {}", i + 1, e);
                UNKNOWN_ITEM.to_string()
            }
        };
        names.push(name);

        if selected_position.is_none() {
            match matcher.is_selected(shot, region) {
                Ok(true) => selected_position = Some(i + 1),
                Ok(false) => {}
                Err(e) => warn!("Selection check failed for slot {}: {}", i + 1, e),
            }
        }
    }

    debug!(
        "Matched toolbar with {} matcher: {:?}, selected {:?}",
        matcher.name(),
        names,
        selected_position
    );

    ToolbarMatch {
        names,
        selected_position,
    }
}

/// [`match_toolbar`] on the blocking thread pool
pub async fn match_toolbar_off_runtime(
    matcher: Arc<dyn TemplateMatcher>,
    screenshots: Vec<PathBuf>,
    catalog: Arc<IconCatalog>,
    region: SelectionBox,
) -> ToolbarMatch {
    if screenshots.is_empty() {
        return ToolbarMatch::default();
    }
    let slots = screenshots.len();
    let task = tokio::task::spawn_blocking(move || {
        match_toolbar(matcher.as_ref(), &screenshots, &catalog, &region)
    });
    match task.await {
        Ok(matched) => matched,
        Err(e) => {
            warn!("Toolbar matching task failed: {}", e);
            ToolbarMatch {
                names: vec![UNKNOWN_ITEM.to_string(); slots],
                selected_position: None,
            }
        }
    }
}

/// Item count from a response such as `Number: 12`
pub fn extract_number(text: &str) -> Option<u32> {
    NUMBER
        .captures_iter(text)
        .find_map(|caps| caps[1].parse().ok())
}
