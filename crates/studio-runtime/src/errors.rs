//! Runtime error type.

use studio_store::StoreError;
use thiserror::Error;

/// Errors from the orchestration core.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// A callback referenced a reply this process does not know.
    #[error("unknown reply: {0}")]
    UnknownReply(String),

    /// The agent subprocess could not be forked.
    #[error("failed to spawn agent process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    /// The caller does not own the referenced reply.
    #[error("reply {0} is not owned by the caller")]
    UnauthorizedInterrupt(String),

    /// The caller does not own the referenced conversation.
    #[error("conversation {0} is not owned by the caller")]
    ForbiddenConversation(String),

    /// Durable store failure on the control path.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Runtime result alias.
pub type Result<T> = std::result::Result<T, RuntimeError>;
