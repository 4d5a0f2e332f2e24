//! `mfgmon-queues`: resilient job submission.
//!
//! Producers submit through [`JobFacade`]. Jobs go to a primary queue backed by
//! an [`ExecutionBackend`]; when the operations queue cannot accept a job after
//! its retries, the job is parked in a durable [`FallbackQueue`] and moved back
//! by a periodic drain pass once the backend recovers.
//!
//! ```text
//! JobFacade ──▶ PrimaryQueue (operations) ──▶ ExecutionBackend
//!                  │  retries exhausted          ▲
//!                  ▼                              │ drain pass
//!              FallbackQueue ──▶ FallbackStore ───┘
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod facade;
pub mod fallback;
pub mod primary;
pub mod store;
pub mod types;
pub mod wiring;
pub mod worker;

pub use backend::{ExecutionBackend, InMemoryBackend, WorkSource};
pub use config::{FallbackConfig, PrimaryConfig, QueueConfig};
pub use error::{BackendError, QueueError, StoreError, WiringError};
pub use facade::{FallbackStatus, JobFacade, JobView, QueuesStatus, SubmitReceipt};
pub use fallback::{DrainOutcome, DrainReport, FallbackQueue, FallbackSink};
pub use primary::{JobSubmitter, PrimaryQueue};
pub use store::{FallbackStore, FileFallbackStore, InMemoryFallbackStore};
pub use types::{
    Backoff, BackoffStrategy, FallbackJob, Job, JobRequest, JobStatus, QueueCounts, QueueKind,
    RetryPolicy, SubmitOptions,
};
pub use wiring::{QueueRuntime, QueueRuntimeBuilder, ReadyFlag};
pub use worker::{JobResult, JobWorker, JobWorkerConfig, JobWorkerHandle, WorkerStats};
