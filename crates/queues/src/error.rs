//! Error types for the queue subsystem.

use std::time::Duration;

use thiserror::Error;

use mfgmon_core::CoreError;

/// Failure reported by an execution backend (broker, worker pool).
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("backend call timed out after {0:?}")]
    Timeout(Duration),
    #[error("backend command failed: {0}")]
    Command(String),
    #[error("backend serialization error: {0}")]
    Serialization(String),
}

/// Failure of the durable fallback store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("fallback store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("fallback store is corrupt: {0}")]
    Corrupt(String),
    #[error("fallback store serialization error: {0}")]
    Serialization(String),
    #[error("fallback store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("fallback store task failed: {0}")]
    Task(String),
}

/// Errors surfaced by the queues and the submission facade.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The queues have not been wired yet; nothing can be accepted.
    #[error("queue system is not ready (wiring has not completed)")]
    NotReady,
    #[error(transparent)]
    Validation(#[from] CoreError),
    #[error("payload is not serializable: {0}")]
    Serialization(String),
    /// The primary queue rejected the job and no fallback is registered.
    #[error("primary queue rejected job: {0}")]
    Backend(#[from] BackendError),
    /// The fallback store could not take the job; it was not accepted anywhere.
    #[error("fallback queue could not accept job: {0}")]
    Fallback(#[from] StoreError),
    /// A lookup could not reach a queue; says nothing about the job itself.
    #[error("job lookup failed: {0}")]
    Lookup(String),
}

impl QueueError {
    /// True when the job was not accepted by any queue.
    pub fn is_rejection(&self) -> bool {
        matches!(self, QueueError::Backend(_) | QueueError::Fallback(_))
    }
}

/// Errors from the post-construction wiring step.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WiringError {
    #[error("queues are already wired")]
    AlreadyWired,
}
