//! Per-reply fan-out hub.
//!
//! Every downstream event for a reply is delivered to every active
//! subscriber without blocking the producer: each subscription carries a
//! bounded buffer, and a subscription that falls behind is detached (its
//! consumer observes end-of-stream) rather than stalling the loop.
//!
//! Ordering: one subscription sees events in publish order. Nothing is
//! promised across replies.

use std::collections::HashMap;

use parking_lot::Mutex;
use studio_core::events::ReplyEvent;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Per-subscription buffer capacity.
const SUBSCRIPTION_BUFFER: usize = 256;

/// Why a reply's channel was closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// The agent finished normally.
    Done,
    /// The user interrupted the reply.
    Cancelled,
    /// The subprocess died without a finished signal.
    Failed,
}

impl CloseReason {
    fn as_str(self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

/// A consumer handle on one reply's event stream.
///
/// Dropping the subscription unsubscribes; the hub notices on its next
/// publish and detaches the dead sender.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::Receiver<ReplyEvent>,
}

impl Subscription {
    /// Receive the next event; `None` means end-of-stream (terminal event
    /// consumed, hub closed, or this subscription was dropped for falling
    /// behind).
    pub async fn recv(&mut self) -> Option<ReplyEvent> {
        self.rx.recv().await
    }

    /// Non-blocking receive, for tests and draining.
    pub fn try_recv(&mut self) -> Option<ReplyEvent> {
        self.rx.try_recv().ok()
    }
}

struct ReplyChannel {
    conversation_id: String,
    subscribers: Vec<mpsc::Sender<ReplyEvent>>,
    closed: bool,
    terminal: Option<ReplyEvent>,
}

/// Multi-reply fan-out registry.
#[derive(Default)]
pub struct FanoutHub {
    channels: Mutex<HashMap<String, ReplyChannel>>,
}

impl FanoutHub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel for a new reply. Idempotent.
    pub fn create(&self, reply_id: &str, conversation_id: &str) {
        let mut channels = self.channels.lock();
        let _ = channels
            .entry(reply_id.to_string())
            .or_insert_with(|| ReplyChannel {
                conversation_id: conversation_id.to_string(),
                subscribers: Vec::new(),
                closed: false,
                terminal: None,
            });
    }

    /// Subscribe to a reply's stream.
    ///
    /// Returns `None` for unknown replies. Subscribing to a closed channel
    /// yields a subscription that delivers the terminal event (if one was
    /// recorded) and then ends.
    pub fn subscribe(&self, reply_id: &str) -> Option<Subscription> {
        let mut channels = self.channels.lock();
        let channel = channels.get_mut(reply_id)?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        if channel.closed {
            if let Some(terminal) = &channel.terminal {
                let _ = tx.try_send(terminal.clone());
            }
            // Sender dropped here: the subscription ends after the replayed
            // terminal event.
        } else {
            channel.subscribers.push(tx);
        }
        Some(Subscription { rx })
    }

    /// Deliver an event to every subscriber of a reply.
    ///
    /// Publishing to an unknown or closed channel is a no-op. A subscriber
    /// whose buffer is full is detached.
    pub fn publish(&self, reply_id: &str, event: &ReplyEvent) {
        let mut channels = self.channels.lock();
        let Some(channel) = channels.get_mut(reply_id) else {
            debug!(reply_id, "publish to unknown reply, dropping");
            return;
        };
        if channel.closed {
            debug!(reply_id, event_type = event.event_type(), "publish after close, dropping");
            return;
        }
        Self::deliver(reply_id, channel, event);
    }

    /// Close a reply's channel: publish the synthetic terminal event, then
    /// refuse further publishes. Idempotent.
    pub fn close(&self, reply_id: &str, reason: CloseReason) {
        let mut channels = self.channels.lock();
        let Some(channel) = channels.get_mut(reply_id) else {
            return;
        };
        if channel.closed {
            return;
        }

        let terminal = ReplyEvent::Done {
            conversation_id: channel.conversation_id.clone(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        debug!(reply_id, reason = reason.as_str(), "closing reply channel");
        Self::deliver(reply_id, channel, &terminal);
        channel.terminal = Some(terminal);
        channel.closed = true;
        // Dropping the senders ends every subscription after its buffered
        // events drain.
        channel.subscribers.clear();
    }

    /// Drop a reply's channel entirely (after the retention window).
    pub fn remove(&self, reply_id: &str) {
        let _ = self.channels.lock().remove(reply_id);
    }

    /// Number of live subscribers for a reply.
    #[must_use]
    pub fn subscriber_count(&self, reply_id: &str) -> usize {
        self.channels
            .lock()
            .get(reply_id)
            .map_or(0, |c| c.subscribers.len())
    }

    /// Number of tracked reply channels (open or closed).
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }

    fn deliver(reply_id: &str, channel: &mut ReplyChannel, event: &ReplyEvent) {
        channel.subscribers.retain(|tx| {
            match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    metrics::counter!("hub_backpressure_drops_total").increment(1);
                    warn!(reply_id, "subscriber buffer full, detaching slow subscription");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // Consumer went away; quietly unsubscribe.
                    false
                }
            }
        });
    }
}
