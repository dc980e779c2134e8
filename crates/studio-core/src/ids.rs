//! Opaque id generation.
//!
//! All ids are UUIDv7 strings — time-ordered, unique per process lifetime,
//! and safe to use as primary keys in the relational store.

use uuid::Uuid;

/// Mint a new reply id.
#[must_use]
pub fn new_reply_id() -> String {
    Uuid::now_v7().to_string()
}

/// Mint a new conversation id.
#[must_use]
pub fn new_conversation_id() -> String {
    Uuid::now_v7().to_string()
}

/// Mint a new message id.
#[must_use]
pub fn new_message_id() -> String {
    Uuid::now_v7().to_string()
}
