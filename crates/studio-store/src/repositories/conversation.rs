//! Conversation lifecycle and listing.

use rusqlite::{params, Connection, OptionalExtension};

use crate::errors::Result;
use crate::row_types::ConversationRow;

/// Conversation repository.
pub struct ConversationRepo;

impl ConversationRepo {
    /// Create a conversation with an explicit id.
    pub fn create(
        conn: &Connection,
        id: &str,
        user_id: &str,
        title: &str,
    ) -> Result<ConversationRow> {
        let now = chrono::Utc::now().to_rfc3339();
        let _ = conn.execute(
            "INSERT INTO conversations (id, user_id, title, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, user_id, title, now, now],
        )?;
        Ok(ConversationRow {
            id: id.to_string(),
            user_id: user_id.to_string(),
            title: title.to_string(),
            created_at: now.clone(),
            updated_at: now,
        })
    }

    /// Get a conversation by id.
    pub fn get_by_id(conn: &Connection, id: &str) -> Result<Option<ConversationRow>> {
        let row = conn
            .query_row(
                "SELECT id, user_id, title, created_at, updated_at
                 FROM conversations WHERE id = ?1",
                params![id],
                Self::map_row,
            )
            .optional()?;
        Ok(row)
    }

    /// List a user's conversations, most recently active first.
    pub fn list_for_user(conn: &Connection, user_id: &str) -> Result<Vec<ConversationRow>> {
        let mut stmt = conn.prepare(
            "SELECT id, user_id, title, created_at, updated_at
             FROM conversations WHERE user_id = ?1
             ORDER BY updated_at DESC",
        )?;
        let rows = stmt
            .query_map(params![user_id], Self::map_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Bump the last-activity timestamp.
    pub fn touch(conn: &Connection, id: &str) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let _ = conn.execute(
            "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
            params![now, id],
        )?;
        Ok(())
    }

    /// Delete a conversation and (via cascade) its messages.
    /// Returns whether a row was deleted.
    pub fn delete(conn: &Connection, id: &str) -> Result<bool> {
        let affected = conn.execute("DELETE FROM conversations WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    }

    fn map_row(row: &rusqlite::Row<'_>) -> std::result::Result<ConversationRow, rusqlite::Error> {
        Ok(ConversationRow {
            id: row.get(0)?,
            user_id: row.get(1)?,
            title: row.get(2)?,
            created_at: row.get(3)?,
            updated_at: row.get(4)?,
        })
    }
}
