//! Request identifiers and per-request delivery state.

use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Opaque, unguessable identifier for an in-flight prompt.
///
/// Generated from a v4 UUID (OS randomness) and rendered as 32 lowercase
/// hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Draw a fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl Borrow<str> for RequestId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for RequestId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Lifecycle of a pending request.
///
/// `Pending` is the only non-terminal state; every transition leaves it and
/// none returns to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestState {
    Pending,
    Fulfilled(String),
    Failed(String),
    Expired,
}

impl RequestState {
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Short lowercase name used in logs and API payloads.
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Fulfilled(_) => "fulfilled",
            Self::Failed(_) => "failed",
            Self::Expired => "expired",
        }
    }
}

/// Result of waiting on a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The workflow delivered an answer.
    Fulfilled(String),
    /// The workflow reported an error, or forwarding failed.
    Failed(String),
    /// The request outlived its maximum pending age and was reaped.
    Expired,
    /// No terminal state within the wait budget. Retryable.
    TimedOut,
}

impl From<RequestState> for Outcome {
    fn from(state: RequestState) -> Self {
        match state {
            RequestState::Fulfilled(text) => Self::Fulfilled(text),
            RequestState::Failed(reason) => Self::Failed(reason),
            RequestState::Expired => Self::Expired,
            // not terminal yet
            RequestState::Pending => Self::TimedOut,
        }
    }
}

/// Point-in-time view of a registry entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub id: RequestId,
    pub state: RequestState,
    pub created_at: Instant,
    /// Whether some waiter has already observed the terminal state.
    pub delivered: bool,
    /// Waiters currently suspended on this entry.
    pub waiters: usize,
}
