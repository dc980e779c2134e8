//! Message transcript storage.

use rusqlite::{params, Connection};

use crate::errors::Result;
use crate::row_types::MessageRow;

/// Message repository.
pub struct MessageRepo;

impl MessageRepo {
    /// Insert a message. Duplicate ids are silently ignored so that
    /// re-deliveries of a finished signal stay idempotent.
    ///
    /// Returns `true` if a row was inserted, `false` if the id already existed.
    pub fn create(
        conn: &Connection,
        id: &str,
        conversation_id: &str,
        role: &str,
        content: &str,
    ) -> Result<bool> {
        let now = chrono::Utc::now().to_rfc3339();
        let affected = conn.execute(
            "INSERT OR IGNORE INTO messages (id, conversation_id, role, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, conversation_id, role, content, now],
        )?;
        Ok(affected > 0)
    }

    /// List a conversation's messages in chronological order.
    pub fn list_for_conversation(
        conn: &Connection,
        conversation_id: &str,
    ) -> Result<Vec<MessageRow>> {
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, role, content, created_at
             FROM messages WHERE conversation_id = ?1
             ORDER BY created_at, id",
        )?;
        let rows = stmt
            .query_map(params![conversation_id], |row| {
                Ok(MessageRow {
                    id: row.get(0)?,
                    conversation_id: row.get(1)?,
                    role: row.get(2)?,
                    content: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
