//! Durable agent-session records, one per reply.

use rusqlite::{params, Connection, OptionalExtension};
use studio_core::status::ReplyStatus;

use crate::errors::Result;
use crate::row_types::AgentSessionRow;

/// Agent session repository.
pub struct AgentSessionRepo;

impl AgentSessionRepo {
    /// Create a session record in the `starting` state.
    pub fn create(
        conn: &Connection,
        reply_id: &str,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let _ = conn.execute(
            "INSERT INTO agent_sessions
             (reply_id, conversation_id, user_id, status, pid, started_at)
             VALUES (?1, ?2, ?3, ?4, NULL, ?5)",
            params![
                reply_id,
                conversation_id,
                user_id,
                ReplyStatus::Starting.as_str(),
                now
            ],
        )?;
        Ok(())
    }

    /// Record the child's OS pid once spawned.
    pub fn set_pid(conn: &Connection, reply_id: &str, pid: i64) -> Result<()> {
        let _ = conn.execute(
            "UPDATE agent_sessions SET pid = ?1 WHERE reply_id = ?2",
            params![pid, reply_id],
        )?;
        Ok(())
    }

    /// Update the session status; terminal statuses also stamp `finished_at`.
    pub fn set_status(conn: &Connection, reply_id: &str, status: ReplyStatus) -> Result<()> {
        if status.is_terminal() {
            let now = chrono::Utc::now().to_rfc3339();
            let _ = conn.execute(
                "UPDATE agent_sessions SET status = ?1, finished_at = ?2 WHERE reply_id = ?3",
                params![status.as_str(), now, reply_id],
            )?;
        } else {
            let _ = conn.execute(
                "UPDATE agent_sessions SET status = ?1 WHERE reply_id = ?2",
                params![status.as_str(), reply_id],
            )?;
        }
        Ok(())
    }

    /// Get a session record by reply id.
    pub fn get_by_reply_id(conn: &Connection, reply_id: &str) -> Result<Option<AgentSessionRow>> {
        let row = conn
            .query_row(
                "SELECT reply_id, conversation_id, user_id, status, pid, started_at, finished_at
                 FROM agent_sessions WHERE reply_id = ?1",
                params![reply_id],
                |row| {
                    Ok(AgentSessionRow {
                        reply_id: row.get(0)?,
                        conversation_id: row.get(1)?,
                        user_id: row.get(2)?,
                        status: row.get(3)?,
                        pid: row.get(4)?,
                        started_at: row.get(5)?,
                        finished_at: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }
}
