//! Recovery pipeline turning an agent's raw text into `CodeChanges` (§4.E).
//!
//! Attempts, in order: direct parse, fenced code-block extraction,
//! post-phrase extraction (after markers like "Returning the JSON
//! response:"), a balanced-brace scan for an object containing `files` and
//! `summary`, and finally an AI-fallback repair call. Every attempt emits a
//! `json:*` event so the Metrics Bridge can bucket strategy success rates.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;

use crate::domain::{CodeChanges, EventContext, EventSeverity, EventType};
use crate::events::EventBus;

use super::agent::CodeAgent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractStrategy {
    Direct,
    Retry,
    Sanitized,
    AiFallback,
}

impl ExtractStrategy {
    fn label(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Retry => "retry",
            Self::Sanitized => "sanitized",
            Self::AiFallback => "ai_fallback_success",
        }
    }
}

const POST_PHRASE_MARKERS: &[&str] = &["Returning the JSON response:", "Here is the JSON:", "JSON response:"];

fn try_direct_parse(text: &str) -> Option<Value> {
    serde_json::from_str(text).ok()
}

fn try_fenced_block(text: &str) -> Option<Value> {
    for fence in ["```json", "```"] {
        if let Some(start) = text.find(fence) {
            let after = &text[start + fence.len()..];
            if let Some(end) = after.find("```") {
                let candidate = after[..end].trim();
                if let Ok(v) = serde_json::from_str(candidate) {
                    return Some(v);
                }
            }
        }
    }
    None
}

fn try_post_phrase(text: &str) -> Option<Value> {
    for marker in POST_PHRASE_MARKERS {
        if let Some(idx) = text.find(marker) {
            let after = text[idx + marker.len()..].trim();
            if let Ok(v) = serde_json::from_str(after) {
                return Some(v);
            }
            if let Some(v) = try_fenced_block(after) {
                return Some(v);
            }
        }
    }
    None
}

/// Scan for the first balanced `{...}` span whose parsed object contains
/// both `files` and `summary` keys.
fn try_balanced_brace_scan(text: &str) -> Option<Value> {
    let bytes = text.as_bytes();
    for (start, &b) in bytes.iter().enumerate() {
        if b != b'{' {
            continue;
        }
        let mut depth = 0i32;
        let mut in_string = false;
        let mut escaped = false;
        for (offset, &c) in bytes[start..].iter().enumerate() {
            if in_string {
                if escaped {
                    escaped = false;
                } else if c == b'\\' {
                    escaped = true;
                } else if c == b'"' {
                    in_string = false;
                }
                continue;
            }
            match c {
                b'"' => in_string = true,
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        let end = start + offset + 1;
                        let candidate = &text[start..end];
                        if let Ok(v) = serde_json::from_str::<Value>(candidate)
                            && v.get("files").is_some()
                            && v.get("summary").is_some()
                        {
                            return Some(v);
                        }
                        break;
                    }
                }
                _ => {}
            }
        }
    }
    None
}

fn emit_attempt(bus: &EventBus, ctx: &EventContext) {
    bus.emit(EventType::JsonParseAttempt, EventSeverity::Info, serde_json::json!({}), ctx.clone());
}

fn emit_success(bus: &EventBus, ctx: &EventContext, retry_count: u32, strategy: ExtractStrategy, duration_ms: u64) {
    bus.emit(
        EventType::JsonParseSuccess,
        EventSeverity::Info,
        serde_json::json!({
            "retryCount": retry_count,
            "strategy": strategy.label(),
            "durationMs": duration_ms,
        }),
        ctx.clone(),
    );
}

fn emit_failure(bus: &EventBus, ctx: &EventContext) {
    bus.emit(EventType::JsonParseFailure, EventSeverity::Warn, serde_json::json!({}), ctx.clone());
}

/// Run the four synchronous strategies (no network/agent call). Returns the
/// parsed document plus how many non-direct attempts preceded success.
pub fn extract_sync(raw: &str, bus: &EventBus, ctx: &EventContext) -> Option<(CodeChanges, ExtractStrategy)> {
    let started = Instant::now();
    emit_attempt(bus, ctx);

    if let Some(v) = try_direct_parse(raw)
        && let Ok(changes) = serde_json::from_value::<CodeChanges>(v)
    {
        emit_success(bus, ctx, 0, ExtractStrategy::Direct, started.elapsed().as_millis() as u64);
        return Some((changes, ExtractStrategy::Direct));
    }

    for (retry, extractor) in [try_fenced_block as fn(&str) -> Option<Value>, try_post_phrase, try_balanced_brace_scan]
        .into_iter()
        .enumerate()
    {
        emit_attempt(bus, ctx);
        if let Some(v) = extractor(raw)
            && let Ok(changes) = serde_json::from_value::<CodeChanges>(v)
        {
            let strategy = if retry == 2 { ExtractStrategy::Sanitized } else { ExtractStrategy::Retry };
            emit_success(bus, ctx, retry as u32 + 1, strategy, started.elapsed().as_millis() as u64);
            return Some((changes, strategy));
        }
    }

    None
}

/// Full pipeline including the AI-fallback repair call, used when every
/// synchronous strategy above has already failed. The fallback call's own
/// token usage is returned alongside the recovered changes so the caller
/// can fold it into the iteration's token budget (§9: the repair call
/// counts toward it).
pub async fn extract_with_fallback(
    raw: &str,
    bus: &EventBus,
    ctx: &EventContext,
    agent: &Arc<dyn CodeAgent>,
) -> Option<(CodeChanges, u64, u64)> {
    if let Some((changes, _)) = extract_sync(raw, bus, ctx) {
        return Some((changes, 0, 0));
    }

    emit_attempt(bus, ctx);
    let started = Instant::now();
    let repaired = agent.repair_json(raw).await.ok()?;
    let value: Value = serde_json::from_str(&repaired.text).ok()?;
    let changes: CodeChanges = serde_json::from_value(value).ok()?;
    emit_success(bus, ctx, 1, ExtractStrategy::AiFallback, started.elapsed().as_millis() as u64);
    Some((changes, repaired.tokens_in, repaired.tokens_out))
}

/// Emit the terminal failure event once every strategy (sync + fallback)
/// has been exhausted.
pub fn emit_unparseable(bus: &EventBus, ctx: &EventContext) {
    emit_failure(bus, ctx);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;

    fn bus() -> EventBus {
        EventBus::new(100)
    }

    #[test]
    fn direct_parse_succeeds_on_well_formed_json() {
        let raw = r#"{"files": [], "summary": "ok"}"#;
        let b = bus();
        let (changes, strategy) = extract_sync(raw, &b, &EventContext::default()).unwrap();
        assert_eq!(strategy, ExtractStrategy::Direct);
        assert_eq!(changes.summary, "ok");
    }

    #[test]
    fn fenced_block_is_extracted() {
        let raw = "Sure, here you go:\n```json\n{\"files\": [], \"summary\": \"fenced\"}\n```\nThanks.";
        let b = bus();
        let (changes, _) = extract_sync(raw, &b, &EventContext::default()).unwrap();
        assert_eq!(changes.summary, "fenced");
    }

    #[test]
    fn post_phrase_marker_is_extracted() {
        let raw = "Some preamble.\nReturning the JSON response:\n{\"files\": [], \"summary\": \"marked\"}";
        let b = bus();
        let (changes, _) = extract_sync(raw, &b, &EventContext::default()).unwrap();
        assert_eq!(changes.summary, "marked");
    }

    #[test]
    fn balanced_brace_scan_finds_embedded_object() {
        let raw = "prefix noise { \"nested\": {} } middle {\"files\": [], \"summary\": \"scanned\"} suffix";
        let b = bus();
        let (changes, strategy) = extract_sync(raw, &b, &EventContext::default()).unwrap();
        assert_eq!(changes.summary, "scanned");
        assert_eq!(strategy, ExtractStrategy::Sanitized);
    }

    #[test]
    fn unrecoverable_text_returns_none() {
        let raw = "this is not json at all";
        let b = bus();
        assert!(extract_sync(raw, &b, &EventContext::default()).is_none());
    }

    #[test]
    fn every_attempt_emits_a_json_event() {
        let raw = r#"{"files": [], "summary": "ok"}"#;
        let b = bus();
        extract_sync(raw, &b, &EventContext::default());
        assert!(!b.get_by_type(EventType::JsonParseAttempt).is_empty());
        assert_eq!(b.get_by_type(EventType::JsonParseSuccess).len(), 1);
    }
}
