// src/error.rs
//! Typed errors for the seams that callers match on.
//!
//! Adapters and configuration use `anyhow`; the core keeps these enums so the
//! coordinator can tell a skipped channel from a fatal credential problem.

use std::time::Duration;

use thiserror::Error;

use crate::state::RunStatus;

/// Failure reported by an external port (feed source or classifier).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortError {
    /// Credentials rejected. Never retried.
    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("rate limited by upstream")]
    RateLimited { retry_after: Option<Duration> },

    #[error("transport failure: {0}")]
    Transport(String),

    /// One feed channel is unreadable; the rest of the run continues.
    #[error("channel {channel} not accessible: {reason}")]
    ChannelAccess { channel: String, reason: String },

    #[error("malformed upstream response: {0}")]
    Malformed(String),
}

impl PortError {
    /// Worth another attempt after a backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, PortError::RateLimited { .. } | PortError::Transport(_))
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            PortError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("subscription {subscription_id} already has run {run_id} in flight")]
    ConcurrentRun {
        subscription_id: String,
        run_id: String,
    },

    /// A processed mark for this key already exists. This is an invariant
    /// violation upstream of the store, never a normal condition.
    #[error("processed mark already exists for {subscription_id}/{channel_id}/{item_id}")]
    DuplicateMark {
        subscription_id: String,
        channel_id: String,
        item_id: String,
    },

    #[error("unknown run {0}")]
    UnknownRun(String),

    #[error("run {run_id} is already {status}")]
    AlreadyTerminal { run_id: String, status: RunStatus },

    #[error("corrupt state row: {0}")]
    Corrupt(String),

    #[error("state database lock poisoned")]
    Poisoned,

    #[error("state directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Why a run ended without a commit.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("fetching {channel} failed: {source}")]
    Fetch {
        channel: String,
        #[source]
        source: PortError,
    },

    /// Credentials rejected while generating articles.
    #[error("classifier failed: {0}")]
    Classifier(#[source] PortError),
}

impl RunError {
    /// The run never started because another one holds the subscription.
    pub fn is_concurrent_run(&self) -> bool {
        matches!(self, RunError::Store(StoreError::ConcurrentRun { .. }))
    }
}
