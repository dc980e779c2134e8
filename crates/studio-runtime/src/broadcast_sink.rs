//! Seam between the orchestration core and the socket bus.
//!
//! The runtime never talks to WebSockets directly; it pushes through this
//! trait and the server crate supplies the real implementation. Delivery is
//! fire-and-forget: implementations log failures and never escalate.

use async_trait::async_trait;
use studio_core::events::ReplyEvent;

/// Fire-and-forget publisher to conversation subscribers.
#[async_trait]
pub trait BroadcastSink: Send + Sync {
    /// Push one downstream event to the reply's conversation room.
    async fn push_reply(&self, conversation_id: &str, reply_id: &str, event: &ReplyEvent);

    /// Announce whether a conversation is currently being replied to.
    async fn push_replying_state(&self, replying: bool, conversation_id: &str);

    /// Announce a reply finished.
    async fn push_finished(&self, reply_id: &str);

    /// Announce a reply was cancelled.
    async fn push_cancelled(&self, reply_id: &str);
}

/// No-op sink for tests and headless runs.
pub struct NullBroadcastSink;

#[async_trait]
impl BroadcastSink for NullBroadcastSink {
    async fn push_reply(&self, _conversation_id: &str, _reply_id: &str, _event: &ReplyEvent) {}
    async fn push_replying_state(&self, _replying: bool, _conversation_id: &str) {}
    async fn push_finished(&self, _reply_id: &str) {}
    async fn push_cancelled(&self, _reply_id: &str) {}
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use parking_lot::Mutex;

    /// Records every push for assertions.
    #[derive(Default)]
    pub struct RecordingSink {
        pub pushes: Mutex<Vec<(String, String, String)>>,
        pub states: Mutex<Vec<(bool, String)>>,
        pub finished: Mutex<Vec<String>>,
        pub cancelled: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl BroadcastSink for RecordingSink {
        async fn push_reply(&self, conversation_id: &str, reply_id: &str, event: &ReplyEvent) {
            self.pushes.lock().push((
                conversation_id.to_string(),
                reply_id.to_string(),
                event.event_type().to_string(),
            ));
        }

        async fn push_replying_state(&self, replying: bool, conversation_id: &str) {
            self.states
                .lock()
                .push((replying, conversation_id.to_string()));
        }

        async fn push_finished(&self, reply_id: &str) {
            self.finished.lock().push(reply_id.to_string());
        }

        async fn push_cancelled(&self, reply_id: &str) {
            self.cancelled.lock().push(reply_id.to_string());
        }
    }
}
