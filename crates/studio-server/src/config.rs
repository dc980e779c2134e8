//! Server configuration.

use serde::{Deserialize, Serialize};

/// Configuration for the studio server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Maximum request body size in bytes.
    pub max_body_bytes: usize,
    /// Maximum concurrent socket connections.
    pub max_connections: usize,
    /// Seconds of SSE inactivity before a heartbeat frame.
    pub sse_heartbeat_secs: u64,
    /// Shared secret required on `/trpc/*` callbacks. `None` relies on
    /// network isolation between agent and orchestrator.
    pub callback_secret: Option<String>,
    /// Root directory for uploaded chat files.
    pub upload_dir: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_body_bytes: 1024 * 1024, // 1 MB
            max_connections: 200,
            sse_heartbeat_secs: 30,
            callback_secret: None,
            upload_dir: "data/chat_files".into(),
        }
    }
}
