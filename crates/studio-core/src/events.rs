//! Event types for the orchestration pipeline.
//!
//! Two event families:
//!
//! - **[`AgentEvent`]**: Raw inbound events posted by the agent subprocess to
//!   the callback endpoint (text deltas, tool calls/results, coordinator
//!   progress signals).
//! - **[`ReplyEvent`]**: Downstream events produced for one reply after
//!   filtering and accumulation. These are what SSE clients and the socket
//!   bus observe.
//!
//! `AgentEvent` is never persisted; `ReplyEvent` drives the wire formats in
//! both transports (the SSE `event:` field is [`ReplyEvent::event_type`]).

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─────────────────────────────────────────────────────────────────────────────
// AgentEvent — inbound callback events
// ─────────────────────────────────────────────────────────────────────────────

/// An event posted by the agent subprocess.
///
/// The wire form is a tagged object (`"type"` discriminator). Unknown extra
/// fields (e.g. the agent's `sequence` counter) are ignored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AgentEvent {
    /// Assistant text delta.
    #[serde(rename = "text")]
    Text {
        /// Text fragment.
        content: String,
    },

    /// Reasoning trace delta.
    #[serde(rename = "thinking")]
    Thinking {
        /// Thinking fragment.
        content: String,
    },

    /// Tool invocation started by the agent.
    #[serde(rename = "tool_call")]
    ToolCall {
        /// Tool call id, pairs the call with its result.
        id: String,
        /// Raw tool name.
        name: String,
        /// Tool arguments.
        #[serde(default)]
        input: Value,
    },

    /// Result of a tool invocation.
    #[serde(rename = "tool_result")]
    ToolResult {
        /// Tool call id this result answers.
        id: String,
        /// Raw tool name.
        name: String,
        /// Tool output text.
        #[serde(default)]
        output: String,
        /// Whether the tool succeeded.
        #[serde(default = "default_true")]
        success: bool,
    },

    /// Structured plan/phase progress signal.
    #[serde(rename = "coordinator_event")]
    Coordinator {
        /// Coordinator event kind (`plan_created`, `phase_started`, ...).
        event_type: String,
        /// Event payload.
        #[serde(default)]
        data: Value,
    },
}

fn default_true() -> bool {
    true
}

// ─────────────────────────────────────────────────────────────────────────────
// Legacy message form
// ─────────────────────────────────────────────────────────────────────────────

/// Legacy callback body: a whole message instead of an event array.
///
/// `content` is either a plain string or an array of content blocks; each
/// block synthesizes one [`AgentEvent::Text`] or [`AgentEvent::Thinking`].
#[derive(Clone, Debug, Deserialize)]
pub struct LegacyMessage {
    /// Message id assigned by the agent, if any.
    #[serde(default)]
    pub id: Option<String>,
    /// String content or an array of `{type, text|thinking}` blocks.
    #[serde(default)]
    pub content: Value,
}

// ─────────────────────────────────────────────────────────────────────────────
// ReplyEvent — downstream events
// ─────────────────────────────────────────────────────────────────────────────

/// Extracted testcase payload pushed to clients.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TestcasePayload {
    /// Generation status reported inside the JSON blob.
    pub status: String,
    /// Number of testcases.
    pub count: u64,
    /// The testcase objects themselves.
    pub testcases: Vec<Value>,
}

/// A downstream event for one reply, observed by every subscriber.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ReplyEvent {
    /// Stream opened; always the first event a subscriber sees.
    #[serde(rename = "start")]
    Start {
        /// Conversation this reply belongs to.
        conversation_id: String,
        /// The reply id.
        reply_id: String,
    },

    /// Assistant text delta (not the accumulated total).
    #[serde(rename = "chunk")]
    Chunk {
        /// Text fragment.
        content: String,
    },

    /// Reasoning trace delta.
    #[serde(rename = "thinking")]
    Thinking {
        /// Thinking fragment.
        content: String,
    },

    /// Visible tool invocation; `name` is the display name.
    #[serde(rename = "tool_call")]
    ToolCall {
        /// Tool call id.
        id: String,
        /// Display name after renaming.
        name: String,
        /// Tool arguments.
        input: Value,
    },

    /// Visible tool result; `name` is the display name.
    #[serde(rename = "tool_result")]
    ToolResult {
        /// Tool call id.
        id: String,
        /// Display name after renaming.
        name: String,
        /// Tool output text.
        output: String,
        /// Whether the tool succeeded.
        success: bool,
    },

    /// Coordinator progress signal, passed through unmodified.
    #[serde(rename = "coordinator_event")]
    Coordinator {
        /// Coordinator event kind.
        event_type: String,
        /// Event payload.
        data: Value,
    },

    /// One-shot extracted testcases.
    #[serde(rename = "testcases")]
    Testcases {
        /// Extracted payload.
        data: TestcasePayload,
    },

    /// Keep-alive frame emitted on SSE inactivity.
    #[serde(rename = "heartbeat")]
    Heartbeat,

    /// The reply was cancelled by the user.
    #[serde(rename = "cancelled")]
    Cancelled {
        /// Human-readable cancellation notice.
        message: String,
    },

    /// Terminal event: the stream is over.
    #[serde(rename = "done")]
    Done {
        /// Conversation this reply belongs to.
        conversation_id: String,
        /// RFC 3339 completion timestamp.
        timestamp: String,
    },

    /// The agent failed mid-stream.
    #[serde(rename = "error")]
    Error {
        /// Error description.
        message: String,
    },
}

impl ReplyEvent {
    /// Wire name of the event, used as the SSE `event:` field.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Chunk { .. } => "chunk",
            Self::Thinking { .. } => "thinking",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::Coordinator { .. } => "coordinator_event",
            Self::Testcases { .. } => "testcases",
            Self::Heartbeat => "heartbeat",
            Self::Cancelled { .. } => "cancelled",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
        }
    }

    /// Whether this event terminates the stream.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. })
    }
}
