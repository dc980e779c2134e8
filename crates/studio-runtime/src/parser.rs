//! Inbound callback payload parsing.
//!
//! The agent posts either a structured event array or (legacy) a whole
//! message whose content blocks synthesize `text`/`thinking` events.
//! Malformed entries are skipped with a warning — a batch never aborts on a
//! single bad event.

use serde_json::Value;
use studio_core::events::{AgentEvent, LegacyMessage};
use tracing::{debug, warn};

/// Parse a raw event array, skipping entries that do not decode.
#[must_use]
pub fn parse_events(raw: &[Value]) -> Vec<AgentEvent> {
    let mut events = Vec::with_capacity(raw.len());
    for entry in raw {
        match serde_json::from_value::<AgentEvent>(entry.clone()) {
            Ok(event) => events.push(event),
            Err(e) => {
                metrics::counter!("parse_skips_total").increment(1);
                warn!(error = %e, entry = %entry, "skipping malformed agent event");
            }
        }
    }
    events
}

/// Synthesize events from a legacy `msg` payload.
///
/// `content` is a plain string (one `text` event) or an array of
/// `{type: "text"|"thinking", text|thinking}` blocks (one event per block).
/// Unknown block types are skipped.
#[must_use]
pub fn legacy_events(msg: &Value) -> Vec<AgentEvent> {
    let legacy: LegacyMessage = match serde_json::from_value(msg.clone()) {
        Ok(legacy) => legacy,
        Err(e) => {
            metrics::counter!("parse_skips_total").increment(1);
            warn!(error = %e, "malformed legacy message payload");
            return Vec::new();
        }
    };

    match &legacy.content {
        Value::String(s) => {
            if s.is_empty() {
                Vec::new()
            } else {
                vec![AgentEvent::Text { content: s.clone() }]
            }
        }
        Value::Array(blocks) => {
            let mut events = Vec::new();
            for block in blocks {
                match block.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        let text = block
                            .get("text")
                            .and_then(Value::as_str)
                            .unwrap_or_default();
                        if !text.is_empty() {
                            events.push(AgentEvent::Text {
                                content: text.to_string(),
                            });
                        }
                    }
                    Some("thinking") => {
                        let thinking = block
                            .get("thinking")
                            .and_then(Value::as_str)
                            .unwrap_or_default();
                        if !thinking.is_empty() {
                            events.push(AgentEvent::Thinking {
                                content: thinking.to_string(),
                            });
                        }
                    }
                    other => {
                        debug!(block_type = ?other, "skipping unsupported legacy content block");
                    }
                }
            }
            events
        }
        _ => {
            warn!("legacy message has no usable content");
            Vec::new()
        }
    }
}

/// Decode one callback body into agent events.
///
/// Prefers the structured `events` array; falls back to the legacy `msg`
/// form. Both absent yields an empty batch.
#[must_use]
pub fn events_from_request(events: Option<&[Value]>, msg: Option<&Value>) -> Vec<AgentEvent> {
    if let Some(raw) = events {
        parse_events(raw)
    } else if let Some(msg) = msg {
        legacy_events(msg)
    } else {
        Vec::new()
    }
}
