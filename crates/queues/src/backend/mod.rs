//! Execution backends: where accepted jobs actually live until a worker runs them.
//!
//! The primary queue only needs three things from a backend: accept a job and
//! hand back an id, look a job up, and report queue depth. Everything else
//! (workers, execution retries, persistence) is the backend's business.
//! Backends that a local [`JobWorker`](crate::worker::JobWorker) can drain
//! also implement [`WorkSource`].

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use mfgmon_core::JobId;

use crate::error::BackendError;
use crate::types::{Job, JobRequest, QueueCounts};

pub use in_memory::InMemoryBackend;
#[cfg(feature = "redis")]
pub use self::redis::RedisBackend;

/// Failed jobs kept for inspection before the oldest is evicted.
pub const DEFAULT_FAILED_RETENTION: usize = 1_000;

/// Execution backend abstraction.
#[async_trait]
pub trait ExecutionBackend: Send + Sync + 'static {
    /// Accept a job for execution. Must not wait for the job to run.
    async fn submit(&self, request: JobRequest) -> Result<JobId, BackendError>;

    /// Look a job up by id. `Ok(None)` means unknown to this backend.
    async fn get_job(&self, id: &JobId) -> Result<Option<Job>, BackendError>;

    /// Current depth per job state.
    async fn counts(&self) -> Result<QueueCounts, BackendError>;
}

#[async_trait]
impl<B: ExecutionBackend + ?Sized> ExecutionBackend for Arc<B> {
    async fn submit(&self, request: JobRequest) -> Result<JobId, BackendError> {
        (**self).submit(request).await
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>, BackendError> {
        (**self).get_job(id).await
    }

    async fn counts(&self) -> Result<QueueCounts, BackendError> {
        (**self).counts().await
    }
}

/// Consumer side of a backend, as driven by a local worker.
#[async_trait]
pub trait WorkSource: Send + Sync + 'static {
    /// Take the oldest job that is ready and mark it active.
    async fn claim(&self) -> Result<Option<Job>, BackendError>;

    /// Record the state a job reached after an execution attempt.
    async fn finish(&self, job: &Job) -> Result<(), BackendError>;

    /// Resolve when new work may be available, or after `idle` at the latest.
    async fn wait_for_work(&self, idle: Duration);
}
