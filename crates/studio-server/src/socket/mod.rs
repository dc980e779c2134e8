//! Socket bus: WebSocket rooms and server-push events.

pub mod broadcast;
pub mod connection;
pub mod session;

pub use broadcast::SocketBroadcaster;
pub use connection::{ClientConnection, SocketNamespace};
pub use session::run_socket_session;
