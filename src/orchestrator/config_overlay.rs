//! Config overlay cascade (§4.G): a per-set overlay merges over the base
//! config, then a per-phase overlay merges over that. Deep object merge;
//! a short list of array-valued paths merge by append-unique, every other
//! array replaces outright.

use serde_json::Value;
use tracing::warn;

/// Array-valued paths that merge by append-unique rather than replace.
const APPEND_UNIQUE_PATHS: &[&str] = &["codebase.filePathPatterns", "framework.rules", "codebase.searchDirs"];

/// Merge `overlay` over `base`. Neither input is mutated; the result is a
/// fresh value. Falls back to `base` (with a warning) if `overlay` is not a
/// JSON object, since a scalar or array overlay has no well-defined merge.
pub fn merge_overlay(base: &Value, overlay: &Value) -> Value {
    if !overlay.is_object() {
        warn!("config overlay is not a JSON object; falling back to base config");
        return base.clone();
    }
    merge_at("", base, overlay)
}

/// Apply the per-set overlay, then the per-phase overlay, over `base`.
/// Either overlay may be absent.
pub fn apply_overlay_cascade(base: &Value, set_overlay: Option<&Value>, phase_overlay: Option<&Value>) -> Value {
    let mut merged = base.clone();
    if let Some(overlay) = set_overlay {
        merged = merge_overlay(&merged, overlay);
    }
    if let Some(overlay) = phase_overlay {
        merged = merge_overlay(&merged, overlay);
    }
    merged
}

fn merge_at(path: &str, base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            let mut out = base_map.clone();
            for (key, overlay_value) in overlay_map {
                let child_path = if path.is_empty() { key.clone() } else { format!("{path}.{key}") };
                let merged = match out.get(key) {
                    Some(existing) => merge_at(&child_path, existing, overlay_value),
                    None => overlay_value.clone(),
                };
                out.insert(key.clone(), merged);
            }
            Value::Object(out)
        }
        (Value::Array(base_items), Value::Array(overlay_items)) if APPEND_UNIQUE_PATHS.contains(&path) => {
            let mut out = base_items.clone();
            for item in overlay_items {
                if !out.contains(item) {
                    out.push(item.clone());
                }
            }
            Value::Array(out)
        }
        (_, overlay_value) => overlay_value.clone(),
    }
}
