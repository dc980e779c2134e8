//! Socket session lifecycle — handles a single connected client from
//! upgrade through disconnect.
//!
//! Inbound frames are `{"event": name, "data": value}`; the client
//! vocabulary is `joinChatRoom` / `leaveChatRoom` with the conversation id
//! as `data`.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument};

use super::broadcast::SocketBroadcaster;
use super::connection::{ClientConnection, SocketNamespace};

/// Run a socket session for one connected client.
///
/// 1. Registers the connection with the broadcaster
/// 2. Forwards outbound events through the send channel
/// 3. Handles room membership messages
/// 4. Cleans up on disconnect
#[instrument(skip_all, fields(client_id = %client_id))]
pub async fn run_socket_session(
    ws: WebSocket,
    namespace: SocketNamespace,
    client_id: String,
    broadcaster: Arc<SocketBroadcaster>,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    let (send_tx, mut send_rx) = mpsc::channel::<String>(256);
    let connection = Arc::new(ClientConnection::new(client_id.clone(), namespace, send_tx));

    info!(client_id, ?namespace, "socket client connected");
    broadcaster.add(connection.clone()).await;

    // Outbound forwarder (send_rx → WebSocket)
    let outbound = tokio::spawn(async move {
        while let Some(msg) = send_rx.recv().await {
            if ws_tx.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    // Inbound loop
    while let Some(Ok(msg)) = ws_rx.next().await {
        let text = match msg {
            Message::Text(ref t) => t.to_string(),
            Message::Close(_) => {
                info!(client_id, "client sent close frame");
                break;
            }
            _ => continue,
        };
        handle_client_message(&connection, &text);
    }

    info!(client_id, "socket client disconnected");
    outbound.abort();
    broadcaster.remove(&client_id).await;
}

fn handle_client_message(connection: &ClientConnection, text: &str) {
    let Ok(parsed) = serde_json::from_str::<Value>(text) else {
        debug!(conn_id = %connection.id, "ignoring unparseable socket frame");
        return;
    };
    let event = parsed.get("event").and_then(Value::as_str).unwrap_or("");
    let conversation_id = parsed.get("data").and_then(Value::as_str).unwrap_or("");

    match event {
        "joinChatRoom" if !conversation_id.is_empty() => {
            let room = format!("chat-{conversation_id}");
            debug!(conn_id = %connection.id, room, "joined room");
            connection.join_room(room);
        }
        "leaveChatRoom" if !conversation_id.is_empty() => {
            let room = format!("chat-{conversation_id}");
            debug!(conn_id = %connection.id, room, "left room");
            connection.leave_room(&room);
        }
        other => {
            debug!(conn_id = %connection.id, event = other, "ignoring socket event");
        }
    }
}
