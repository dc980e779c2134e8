//! Reply and plan status enums shared by the runtime and the store.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a reply.
///
/// Transitions are monotonic: `Starting → Running → {Completed|Cancelled|Failed}`.
/// Terminal states are absorbing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    /// Reply created, subprocess not yet confirmed live.
    Starting,
    /// Subprocess is live and may post events.
    Running,
    /// The agent signalled completion.
    Completed,
    /// The user interrupted the reply.
    Cancelled,
    /// The subprocess exited without a finished signal, or spawn failed.
    Failed,
}

impl ReplyStatus {
    /// Whether this status is terminal.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    /// Whether `next` is a legal transition from `self`.
    ///
    /// Staying in place is allowed (idempotent re-application); regressing or
    /// leaving a terminal state is not.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        if self == next {
            return true;
        }
        match self {
            Self::Starting => true,
            Self::Running => next != Self::Starting,
            Self::Completed | Self::Cancelled | Self::Failed => false,
        }
    }

    /// Stable string form used in the durable store.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    /// Parse the store string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "starting" => Some(Self::Starting),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "cancelled" => Some(Self::Cancelled),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for ReplyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a persisted coordinator plan.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    /// Plan is executing.
    Running,
    /// Every phase finished and the task completed.
    Completed,
    /// The task or its execution failed.
    Failed,
}

impl PlanStatus {
    /// Stable string form used in the durable store.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
