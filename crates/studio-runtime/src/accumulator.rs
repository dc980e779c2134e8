//! Per-reply transcript state.
//!
//! The accumulator owns everything transient about one reply's content:
//! the running assistant text (flushed to the store on completion), the ids
//! of hidden tool calls (so their paired results are dropped too), and the
//! one-shot testcase extraction flag.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use studio_core::events::{AgentEvent, ReplyEvent, TestcasePayload};
use tracing::{debug, warn};

use crate::tool_filter::ToolDisplayFilter;

/// Minimum accumulated length before extraction is attempted.
const TESTCASE_MIN_CHARS: usize = 100;

/// Tokens whose presence hints at an embedded testcase JSON blob.
const TESTCASE_HINTS: [&str; 4] = [
    "\"testcases\"",
    "\"interface_name\"",
    "generate_positive_cases",
    "generate_negative_cases",
];

fn testcase_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Greedy on purpose: grabs the outermost braces around the testcases array.
    RE.get_or_init(|| Regex::new(r#"(?s)\{.*"testcases".*\}"#).expect("static regex"))
}

/// Mutable per-reply content state.
#[derive(Debug, Default)]
pub struct TranscriptAccumulator {
    accumulated_text: String,
    hidden_tool_ids: HashSet<String>,
    testcase_extracted: bool,
}

impl TranscriptAccumulator {
    /// Fresh accumulator for a new reply.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The full assistant text accumulated so far.
    #[must_use]
    pub fn accumulated_text(&self) -> &str {
        &self.accumulated_text
    }

    /// Whether a testcases event has already been produced.
    #[must_use]
    pub fn testcase_extracted(&self) -> bool {
        self.testcase_extracted
    }

    /// Apply one inbound agent event, producing zero or more downstream
    /// events.
    ///
    /// Text accumulates and re-emits the delta; hidden tool calls record
    /// their id and vanish along with their paired results; everything else
    /// passes through with display names substituted.
    pub fn apply(&mut self, event: AgentEvent, filter: &ToolDisplayFilter) -> Vec<ReplyEvent> {
        match event {
            AgentEvent::Text { content } => {
                if content.is_empty() {
                    return Vec::new();
                }
                self.accumulated_text.push_str(&content);
                let mut out = vec![ReplyEvent::Chunk { content }];
                if let Some(data) = self.try_extract_testcases() {
                    out.push(ReplyEvent::Testcases { data });
                }
                out
            }
            AgentEvent::Thinking { content } => {
                if content.is_empty() {
                    Vec::new()
                } else {
                    vec![ReplyEvent::Thinking { content }]
                }
            }
            AgentEvent::ToolCall { id, name, input } => {
                if filter.is_hidden(&name) {
                    debug!(tool = name, id, "dropping hidden tool call");
                    let _ = self.hidden_tool_ids.insert(id);
                    Vec::new()
                } else {
                    vec![ReplyEvent::ToolCall {
                        id,
                        name: filter.display(&name),
                        input,
                    }]
                }
            }
            AgentEvent::ToolResult {
                id,
                name,
                output,
                success,
            } => {
                if filter.is_hidden(&name) || self.hidden_tool_ids.contains(&id) {
                    debug!(tool = name, id, "dropping hidden tool result");
                    Vec::new()
                } else {
                    vec![ReplyEvent::ToolResult {
                        id,
                        name: filter.display(&name),
                        output,
                        success,
                    }]
                }
            }
            AgentEvent::Coordinator { event_type, data } => {
                vec![ReplyEvent::Coordinator { event_type, data }]
            }
        }
    }

    /// One-shot testcase extraction over the accumulated text.
    fn try_extract_testcases(&mut self) -> Option<TestcasePayload> {
        if self.testcase_extracted {
            return None;
        }
        let text = &self.accumulated_text;
        if text.chars().count() <= TESTCASE_MIN_CHARS {
            return None;
        }
        if !TESTCASE_HINTS.iter().any(|hint| text.contains(hint)) {
            return None;
        }
        let matched = testcase_regex().find(text)?;

        let data: Value = match serde_json::from_str(matched.as_str()) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "testcase blob matched but did not parse as JSON");
                return None;
            }
        };
        let testcases = data.get("testcases")?.as_array()?;
        if testcases.is_empty() {
            return None;
        }

        self.testcase_extracted = true;
        let count = data
            .get("count")
            .and_then(Value::as_u64)
            .unwrap_or(testcases.len() as u64);
        let status = data
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        Some(TestcasePayload {
            status,
            count,
            testcases: testcases.clone(),
        })
    }
}
