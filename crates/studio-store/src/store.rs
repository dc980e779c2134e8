//! The [`StudioStore`] facade — one pooled handle per operation, delegating
//! to the stateless repositories.

use serde_json::Value;
use studio_core::ids;
use studio_core::status::ReplyStatus;

use crate::connection::ConnectionPool;
use crate::errors::Result;
use crate::repositories::{
    AgentSessionRepo, ConversationRepo, KvRepo, MessageRepo, PlanRepo, UserRepo,
};
use crate::row_types::{AgentSessionRow, ConversationRow, MessageRow, PlanRow};

/// TTL for crash-forensic reply snapshots.
const REPLY_STATE_TTL_SECS: i64 = 3600;

/// Durable store handle. Cheap to clone.
#[derive(Clone)]
pub struct StudioStore {
    pool: ConnectionPool,
}

impl StudioStore {
    /// Wrap a connection pool.
    #[must_use]
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    /// The underlying pool (for migrations and maintenance).
    #[must_use]
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    // ── Users ───────────────────────────────────────────────────────────

    /// Ensure a user row exists.
    pub fn ensure_user(&self, user_id: &str) -> Result<()> {
        let conn = self.pool.get()?;
        UserRepo::ensure(&conn, user_id)
    }

    // ── Conversations ───────────────────────────────────────────────────

    /// Create a conversation with a fresh id.
    pub fn create_conversation(&self, user_id: &str, title: &str) -> Result<ConversationRow> {
        let conn = self.pool.get()?;
        UserRepo::ensure(&conn, user_id)?;
        ConversationRepo::create(&conn, &ids::new_conversation_id(), user_id, title)
    }

    /// Create a conversation with a caller-supplied id.
    pub fn create_conversation_with_id(
        &self,
        id: &str,
        user_id: &str,
        title: &str,
    ) -> Result<ConversationRow> {
        let conn = self.pool.get()?;
        UserRepo::ensure(&conn, user_id)?;
        ConversationRepo::create(&conn, id, user_id, title)
    }

    /// Get a conversation by id.
    pub fn get_conversation(&self, id: &str) -> Result<Option<ConversationRow>> {
        let conn = self.pool.get()?;
        ConversationRepo::get_by_id(&conn, id)
    }

    /// List a user's conversations, most recently active first.
    pub fn list_conversations(&self, user_id: &str) -> Result<Vec<ConversationRow>> {
        let conn = self.pool.get()?;
        ConversationRepo::list_for_user(&conn, user_id)
    }

    /// Bump a conversation's last-activity timestamp.
    pub fn touch_conversation(&self, id: &str) -> Result<()> {
        let conn = self.pool.get()?;
        ConversationRepo::touch(&conn, id)
    }

    /// Delete a conversation and its messages.
    pub fn delete_conversation(&self, id: &str) -> Result<bool> {
        let conn = self.pool.get()?;
        ConversationRepo::delete(&conn, id)
    }

    // ── Messages ────────────────────────────────────────────────────────

    /// Persist a message. Duplicate ids are ignored; returns whether a row
    /// was inserted.
    pub fn create_message(
        &self,
        id: &str,
        conversation_id: &str,
        role: &str,
        content: &str,
    ) -> Result<bool> {
        let conn = self.pool.get()?;
        MessageRepo::create(&conn, id, conversation_id, role, content)
    }

    /// List a conversation's transcript in order.
    pub fn list_messages(&self, conversation_id: &str) -> Result<Vec<MessageRow>> {
        let conn = self.pool.get()?;
        MessageRepo::list_for_conversation(&conn, conversation_id)
    }

    // ── Agent sessions ──────────────────────────────────────────────────

    /// Create the durable record for a reply, in `starting` state.
    pub fn create_agent_session(
        &self,
        reply_id: &str,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<()> {
        let conn = self.pool.get()?;
        AgentSessionRepo::create(&conn, reply_id, conversation_id, user_id)
    }

    /// Record the spawned child's pid.
    pub fn set_agent_session_pid(&self, reply_id: &str, pid: i64) -> Result<()> {
        let conn = self.pool.get()?;
        AgentSessionRepo::set_pid(&conn, reply_id, pid)
    }

    /// Update a reply's durable status.
    pub fn set_agent_session_status(&self, reply_id: &str, status: ReplyStatus) -> Result<()> {
        let conn = self.pool.get()?;
        AgentSessionRepo::set_status(&conn, reply_id, status)
    }

    /// Get the durable record for a reply.
    pub fn get_agent_session(&self, reply_id: &str) -> Result<Option<AgentSessionRow>> {
        let conn = self.pool.get()?;
        AgentSessionRepo::get_by_reply_id(&conn, reply_id)
    }

    // ── Coordinator plans ───────────────────────────────────────────────

    /// Get the plan row for a conversation.
    pub fn get_plan(&self, conversation_id: &str) -> Result<Option<PlanRow>> {
        let conn = self.pool.get()?;
        PlanRepo::get_by_conversation(&conn, conversation_id)
    }

    /// Insert or replace the plan row for a conversation.
    pub fn upsert_plan(&self, row: &PlanRow) -> Result<()> {
        let conn = self.pool.get()?;
        PlanRepo::upsert(&conn, row)
    }

    // ── Crash-forensic KV ───────────────────────────────────────────────

    /// Snapshot transient reply state under `agent:reply:{id}` with a 1 h TTL.
    pub fn put_reply_state(&self, reply_id: &str, state: &Value) -> Result<()> {
        let conn = self.pool.get()?;
        KvRepo::put(
            &conn,
            &format!("agent:reply:{reply_id}"),
            &state.to_string(),
            REPLY_STATE_TTL_SECS,
        )
    }

    /// Read back a reply snapshot, if still live.
    pub fn get_reply_state(&self, reply_id: &str) -> Result<Option<Value>> {
        let conn = self.pool.get()?;
        let Some(raw) = KvRepo::get(&conn, &format!("agent:reply:{reply_id}"))? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(&raw)?))
    }

    /// Purge expired KV entries. Returns the number of rows removed.
    pub fn purge_expired_state(&self) -> Result<usize> {
        let conn = self.pool.get()?;
        KvRepo::purge_expired(&conn)
    }
}
