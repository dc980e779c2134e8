//! User rows. Identity is established upstream; this repo only guarantees a
//! row exists for foreign-key integrity.

use rusqlite::{params, Connection};

use crate::errors::Result;

/// User repository.
pub struct UserRepo;

impl UserRepo {
    /// Ensure a user row exists. Idempotent.
    pub fn ensure(conn: &Connection, user_id: &str) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let _ = conn.execute(
            "INSERT OR IGNORE INTO users (id, created_at) VALUES (?1, ?2)",
            params![user_id, now],
        )?;
        Ok(())
    }

    /// Whether a user row exists.
    pub fn exists(conn: &Connection, user_id: &str) -> Result<bool> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM users WHERE id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}
