//! JSON rendering of gathering and stage results for stdout.

use serde_json::{json, Map, Value};

use furrow_planner::{Observation, ParsedResponse, StageOutcome};

/// Sections as a JSON object, with untitled leading text under `preamble`
pub fn sections_json(parsed: &ParsedResponse) -> Value {
    let mut map = Map::new();
    if let Some(preamble) = &parsed.preamble {
        map.insert("preamble".to_string(), Value::String(preamble.clone()));
    }
    for key in parsed.keys() {
        if let Some(value) = parsed.get(key) {
            map.insert(key.to_string(), value.clone());
        }
    }
    Value::Object(map)
}

pub fn observation_json(observation: &Observation) -> Value {
    let dialogues: Vec<Value> = observation
        .dialogues
        .iter()
        .map(|fact| json!({ "frame": fact.key.to_string(), "text": fact.text() }))
        .collect();

    json!({
        "success": observation.success,
        "flag": observation.flag,
        "objects": observation.objects,
        "toolbar": observation.toolbar,
        "last_task_guidance": observation.last_task_guidance,
        "dialogues": dialogues,
        "scene": observation.scene.as_ref().map(sections_json),
        "detection": observation.detection,
        "minimap": observation.minimap,
        "frames_indexed": observation.frames.len(),
    })
}

pub fn stage_json(name: &str, outcome: &StageOutcome) -> Value {
    json!({
        "stage": name,
        "flag": outcome.flag,
        "result": sections_json(&outcome.result),
    })
}
