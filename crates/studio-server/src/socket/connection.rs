//! Socket client connection state.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Which namespace a connection belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketNamespace {
    /// Frontend clients (`/ws/client`): rooms, reply pushes.
    Client,
    /// Agents (`/ws/agent`): reserved, receives `interrupt`.
    Agent,
}

/// Represents one connected socket client.
pub struct ClientConnection {
    /// Unique connection id.
    pub id: String,
    /// Namespace the connection attached to.
    pub namespace: SocketNamespace,
    /// Rooms this connection joined.
    rooms: Mutex<HashSet<String>>,
    /// Send channel to the connection's write task.
    tx: mpsc::Sender<String>,
    /// When this connection was established.
    pub connected_at: Instant,
    /// Count of messages dropped due to a full channel.
    pub dropped_messages: AtomicU64,
}

impl ClientConnection {
    /// Create a new connection.
    #[must_use]
    pub fn new(id: String, namespace: SocketNamespace, tx: mpsc::Sender<String>) -> Self {
        Self {
            id,
            namespace,
            rooms: Mutex::new(HashSet::new()),
            tx,
            connected_at: Instant::now(),
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Join a room.
    pub fn join_room(&self, room: String) {
        let _ = self.rooms.lock().insert(room);
    }

    /// Leave a room.
    pub fn leave_room(&self, room: &str) {
        let _ = self.rooms.lock().remove(room);
    }

    /// Whether the connection is in a room.
    #[must_use]
    pub fn in_room(&self, room: &str) -> bool {
        self.rooms.lock().contains(room)
    }

    /// Send a text message to the client.
    ///
    /// Returns `false` if the channel is full or closed, and increments the
    /// dropped-message counter.
    pub fn send(&self, message: String) -> bool {
        if self.tx.try_send(message).is_ok() {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Total messages dropped for this connection.
    #[must_use]
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }
}
