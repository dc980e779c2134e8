//! Versioned schema migrations, tracked through `PRAGMA user_version`.

use rusqlite::Connection;
use tracing::info;

use crate::errors::Result;

/// Current schema version.
pub const SCHEMA_VERSION: i64 = 1;

const V1: &str = "
CREATE TABLE IF NOT EXISTS users (
    id          TEXT PRIMARY KEY,
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS conversations (
    id          TEXT PRIMARY KEY,
    user_id     TEXT NOT NULL REFERENCES users(id),
    title       TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_conversations_user
    ON conversations(user_id, updated_at);

CREATE TABLE IF NOT EXISTS messages (
    id               TEXT PRIMARY KEY,
    conversation_id  TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    role             TEXT NOT NULL,
    content          TEXT NOT NULL,
    created_at       TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_conversation
    ON messages(conversation_id, created_at);

CREATE TABLE IF NOT EXISTS tasks (
    id               TEXT PRIMARY KEY,
    conversation_id  TEXT,
    task_type        TEXT NOT NULL,
    status           TEXT NOT NULL,
    created_at       TEXT NOT NULL,
    updated_at       TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS agent_sessions (
    reply_id         TEXT PRIMARY KEY,
    conversation_id  TEXT NOT NULL,
    user_id          TEXT NOT NULL,
    status           TEXT NOT NULL,
    pid              INTEGER,
    started_at       TEXT NOT NULL,
    finished_at      TEXT
);
CREATE INDEX IF NOT EXISTS idx_agent_sessions_conversation
    ON agent_sessions(conversation_id);

CREATE TABLE IF NOT EXISTS coordinator_plans (
    conversation_id   TEXT PRIMARY KEY,
    objective         TEXT NOT NULL,
    plan              TEXT NOT NULL,
    active_phase      INTEGER,
    completed_phases  TEXT NOT NULL DEFAULT '[]',
    phase_outputs     TEXT NOT NULL DEFAULT '{}',
    status            TEXT NOT NULL,
    updated_at        TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS kv_state (
    key         TEXT PRIMARY KEY,
    value       TEXT NOT NULL,
    expires_at  TEXT NOT NULL
);
";

/// Run all pending migrations. Returns the resulting schema version.
pub fn run_migrations(conn: &Connection) -> Result<i64> {
    let current: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    if current < 1 {
        conn.execute_batch(V1)?;
        conn.pragma_update(None, "user_version", 1)?;
        info!(from = current, to = 1, "applied schema migration");
    }

    Ok(SCHEMA_VERSION)
}
