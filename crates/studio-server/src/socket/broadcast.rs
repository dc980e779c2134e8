//! Event fan-out to connected socket clients.
//!
//! Server push vocabulary (mirrored by the frontend):
//! `pushReplies` into room `chat-{conversation_id}`, `pushReplyingState`,
//! `pushFinished`, and `pushCancelled` to the whole client namespace, and
//! the reserved `interrupt` to the agent namespace. Delivery is
//! fire-and-forget; failures are logged and counted, never escalated.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use studio_core::events::ReplyEvent;
use studio_runtime::BroadcastSink;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::connection::{ClientConnection, SocketNamespace};

/// Manages socket connections and event broadcasting.
#[derive(Default)]
pub struct SocketBroadcaster {
    /// Connections indexed by connection id.
    connections: RwLock<HashMap<String, Arc<ClientConnection>>>,
}

impl SocketBroadcaster {
    /// Create a new broadcaster.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection.
    pub async fn add(&self, connection: Arc<ClientConnection>) {
        let mut conns = self.connections.write().await;
        let _ = conns.insert(connection.id.clone(), connection);
    }

    /// Remove a connection by id.
    pub async fn remove(&self, connection_id: &str) {
        let mut conns = self.connections.write().await;
        let _ = conns.remove(connection_id);
    }

    /// Number of active connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Emit an event to the client-namespace connections in a room.
    pub async fn emit_room(&self, room: &str, event: &str, payload: Value) {
        let Some(message) = envelope(event, payload) else {
            return;
        };
        let conns = self.connections.read().await;
        for conn in conns.values() {
            if conn.namespace == SocketNamespace::Client && conn.in_room(room) {
                deliver(conn, &message, event);
            }
        }
    }

    /// Emit an event to every client-namespace connection.
    pub async fn emit_clients(&self, event: &str, payload: Value) {
        self.emit_namespace(SocketNamespace::Client, event, payload)
            .await;
    }

    /// Emit the reserved `interrupt` event to the agent namespace.
    pub async fn send_interrupt(&self) {
        self.emit_namespace(SocketNamespace::Agent, "interrupt", json!({}))
            .await;
    }

    async fn emit_namespace(&self, namespace: SocketNamespace, event: &str, payload: Value) {
        let Some(message) = envelope(event, payload) else {
            return;
        };
        let conns = self.connections.read().await;
        for conn in conns.values() {
            if conn.namespace == namespace {
                deliver(conn, &message, event);
            }
        }
    }
}

fn envelope(event: &str, payload: Value) -> Option<String> {
    match serde_json::to_string(&json!({"event": event, "data": payload})) {
        Ok(message) => Some(message),
        Err(e) => {
            warn!(event, error = %e, "failed to serialize socket event");
            None
        }
    }
}

fn deliver(conn: &ClientConnection, message: &str, event: &str) {
    if !conn.send(message.to_string()) {
        metrics::counter!("broadcast_failures_total").increment(1);
        warn!(conn_id = %conn.id, event, "failed to send socket event");
    }
}

#[async_trait]
impl BroadcastSink for SocketBroadcaster {
    async fn push_reply(&self, conversation_id: &str, reply_id: &str, event: &ReplyEvent) {
        let room = format!("chat-{conversation_id}");
        debug!(room, reply_id, event_type = event.event_type(), "push reply event");
        self.emit_room(
            &room,
            "pushReplies",
            json!({"replyId": reply_id, "message": event}),
        )
        .await;
    }

    async fn push_replying_state(&self, replying: bool, conversation_id: &str) {
        self.emit_clients(
            "pushReplyingState",
            json!({"replying": replying, "conversation_id": conversation_id}),
        )
        .await;
    }

    async fn push_finished(&self, reply_id: &str) {
        self.emit_clients("pushFinished", json!({"replyId": reply_id}))
            .await;
    }

    async fn push_cancelled(&self, reply_id: &str) {
        self.emit_clients("pushCancelled", json!({"replyId": reply_id}))
            .await;
    }
}
