//! Short-lived key-value state with TTL.
//!
//! Holds `agent:reply:{id}` snapshots for crash forensics. Expiry is enforced
//! on read; [`KvRepo::purge_expired`] reclaims rows in the background.

use rusqlite::{params, Connection, OptionalExtension};

use crate::errors::Result;

/// Key-value repository.
pub struct KvRepo;

impl KvRepo {
    /// Upsert a value with a TTL in seconds.
    pub fn put(conn: &Connection, key: &str, value: &str, ttl_secs: i64) -> Result<()> {
        let expires_at = (chrono::Utc::now() + chrono::Duration::seconds(ttl_secs)).to_rfc3339();
        let _ = conn.execute(
            "INSERT INTO kv_state (key, value, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
               value = excluded.value,
               expires_at = excluded.expires_at",
            params![key, value, expires_at],
        )?;
        Ok(())
    }

    /// Get a value; expired entries read as absent.
    pub fn get(conn: &Connection, key: &str) -> Result<Option<String>> {
        let now = chrono::Utc::now().to_rfc3339();
        let row = conn
            .query_row(
                "SELECT value FROM kv_state WHERE key = ?1 AND expires_at > ?2",
                params![key, now],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row)
    }

    /// Delete expired entries. Returns the number of rows removed.
    pub fn purge_expired(conn: &Connection) -> Result<usize> {
        let now = chrono::Utc::now().to_rfc3339();
        let affected = conn.execute("DELETE FROM kv_state WHERE expires_at <= ?1", params![now])?;
        Ok(affected)
    }
}
