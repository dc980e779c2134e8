//! Row structs mapped from `SQLite` query results.

use serde::Serialize;
use serde_json::Value;

/// One conversation.
#[derive(Clone, Debug, Serialize)]
pub struct ConversationRow {
    /// Conversation id.
    pub id: String,
    /// Owning user.
    pub user_id: String,
    /// Display title (first 50 characters of the opening message).
    pub title: String,
    /// Creation timestamp (RFC 3339).
    pub created_at: String,
    /// Last-activity timestamp (RFC 3339).
    pub updated_at: String,
}

/// One persisted chat message.
#[derive(Clone, Debug, Serialize)]
pub struct MessageRow {
    /// Message id.
    pub id: String,
    /// Conversation the message belongs to.
    pub conversation_id: String,
    /// `"user"` or `"assistant"`.
    pub role: String,
    /// Message text.
    pub content: String,
    /// Creation timestamp (RFC 3339).
    pub created_at: String,
}

/// Durable record of one agent run.
#[derive(Clone, Debug, Serialize)]
pub struct AgentSessionRow {
    /// Reply id, unique per run.
    pub reply_id: String,
    /// Conversation the run belongs to.
    pub conversation_id: String,
    /// User who initiated the run.
    pub user_id: String,
    /// Lifecycle status string.
    pub status: String,
    /// OS process id of the agent child, if known.
    pub pid: Option<i64>,
    /// Start timestamp (RFC 3339).
    pub started_at: String,
    /// Terminal timestamp (RFC 3339), once the run ended.
    pub finished_at: Option<String>,
}

/// Persisted projection of coordinator events for one conversation.
#[derive(Clone, Debug, Serialize)]
pub struct PlanRow {
    /// Conversation key (one plan per conversation).
    pub conversation_id: String,
    /// Plan objective.
    pub objective: String,
    /// The original plan document.
    pub plan: Value,
    /// Currently executing phase, if any.
    pub active_phase: Option<i64>,
    /// Phases that have completed, in completion order.
    pub completed_phases: Vec<i64>,
    /// Map from `phase_{n}` to the phase evaluation output.
    pub phase_outputs: Value,
    /// Plan status string.
    pub status: String,
    /// Last update timestamp (RFC 3339).
    pub updated_at: String,
}

