//! Submission facade: what the rest of the application calls.
//!
//! Callers never see retries or the fallback. A successful `submit_job`
//! means the job was accepted by the operations queue or parked in the
//! fallback store; the returned id tells which.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, warn};

use mfgmon_core::{JobId, JobName};

use crate::error::QueueError;
use crate::fallback::DrainOutcome;
use crate::types::{FallbackJob, Job, QueueCounts, QueueKind, SubmitOptions};
use crate::wiring::QueueRuntime;

/// Acknowledgement returned to producers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmitReceipt {
    pub job_id: JobId,
}

/// Where a looked-up job currently lives.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "location", content = "job")]
pub enum JobView {
    Primary(Job),
    Fallback(FallbackJob),
}

impl JobView {
    pub fn location(&self) -> &'static str {
        match self {
            JobView::Primary(_) => "primary",
            JobView::Fallback(_) => "fallback",
        }
    }
}

/// `error` is set when the store could not be read; `pending` is then zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FallbackStatus {
    pub pending: usize,
    pub processing: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub error: bool,
}

/// Depth of every queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueuesStatus {
    pub primary: QueueCounts,
    pub database: QueueCounts,
    pub fallback: FallbackStatus,
}

/// Cloneable handle over the runtime.
#[derive(Debug, Clone)]
pub struct JobFacade {
    runtime: Arc<QueueRuntime>,
}

impl JobFacade {
    pub fn new(runtime: Arc<QueueRuntime>) -> Self {
        Self { runtime }
    }

    pub fn runtime(&self) -> &Arc<QueueRuntime> {
        &self.runtime
    }

    pub fn is_ready(&self) -> bool {
        self.runtime.is_ready()
    }

    /// Submit to the operations queue with its default policy.
    pub async fn submit_job<P: Serialize + ?Sized>(
        &self,
        name: &str,
        payload: &P,
    ) -> Result<SubmitReceipt, QueueError> {
        self.submit_to(QueueKind::Operations, name, payload, SubmitOptions::default())
            .await
    }

    /// Submit to a specific queue with per-call overrides.
    pub async fn submit_to<P: Serialize + ?Sized>(
        &self,
        queue: QueueKind,
        name: &str,
        payload: &P,
        options: SubmitOptions,
    ) -> Result<SubmitReceipt, QueueError> {
        if !self.runtime.is_ready() {
            return Err(QueueError::NotReady);
        }

        let name = JobName::new(name)?;
        let payload =
            serde_json::to_value(payload).map_err(|e| QueueError::Serialization(e.to_string()))?;

        match self.runtime.queue(queue).submit(name.clone(), payload, options).await {
            Ok(job_id) => {
                debug!(%queue, job_name = %name, %job_id, "job submitted");
                Ok(SubmitReceipt { job_id })
            }
            Err(err) => {
                error!(%queue, job_name = %name, error = %err, "job submission failed");
                Err(err)
            }
        }
    }

    /// Look a job up by the id `submit_job` returned.
    ///
    /// Fallback ids are served from the fallback store; once a fallback job
    /// has been moved back it is no longer found under that id.
    ///
    /// A queue that cannot be reached is skipped; the lookup only fails when
    /// no reachable queue has the job and at least one could not be asked.
    pub async fn get_job(&self, id: &JobId) -> Result<Option<JobView>, QueueError> {
        if id.is_fallback() {
            return match self.runtime.fallback().get_job(id).await {
                Ok(job) => Ok(job.map(JobView::Fallback)),
                Err(err) => Err(QueueError::Lookup(err.to_string())),
            };
        }

        let mut unreachable = None;
        for queue in [self.runtime.operations(), self.runtime.database()] {
            match queue.get_job(id).await {
                Ok(Some(job)) => return Ok(Some(JobView::Primary(job))),
                Ok(None) => {}
                Err(err) => {
                    warn!(queue = %queue.kind(), job_id = %id, error = %err, "job lookup skipped unreachable queue");
                    unreachable.get_or_insert(err);
                }
            }
        }

        match unreachable {
            Some(err) => Err(QueueError::Lookup(err.to_string())),
            None => Ok(None),
        }
    }

    /// Depth of every queue. Never fails; unreadable parts are flagged.
    pub async fn status(&self) -> QueuesStatus {
        let (primary, database, pending) = tokio::join!(
            self.runtime.operations().status(),
            self.runtime.database().status(),
            self.runtime.fallback().pending_count()
        );
        let fallback = match pending {
            Ok(pending) => FallbackStatus {
                pending,
                processing: self.runtime.fallback().is_draining(),
                error: false,
            },
            Err(err) => {
                error!(error = %err, "failed to read fallback queue status");
                FallbackStatus {
                    pending: 0,
                    processing: self.runtime.fallback().is_draining(),
                    error: true,
                }
            }
        };

        QueuesStatus {
            primary,
            database,
            fallback,
        }
    }

    /// Run a drain pass now instead of waiting for the timer.
    pub async fn process_fallback_now(&self) -> Result<DrainOutcome, QueueError> {
        self.runtime.fallback().process_fallback_jobs().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::config::{PrimaryConfig, QueueConfig};
    use crate::store::InMemoryFallbackStore;
    use crate::types::RetryPolicy;
    use std::time::Duration;

    fn facade(backend: Arc<InMemoryBackend>) -> JobFacade {
        let fast = PrimaryConfig::operations().with_policy(RetryPolicy::fixed(0, Duration::ZERO));
        let config = QueueConfig::default()
            .with_operations(fast.clone())
            .with_database(fast);
        let runtime = QueueRuntime::builder(config)
            .operations_backend(backend)
            .store(InMemoryFallbackStore::arc())
            .build();
        JobFacade::new(Arc::new(runtime))
    }

    #[tokio::test]
    async fn submissions_before_wiring_are_refused() {
        let facade = facade(InMemoryBackend::arc());
        let err = facade.submit_job("createCustomer", &serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, QueueError::NotReady));
    }

    #[tokio::test]
    async fn invalid_names_are_rejected_before_any_queue() {
        let facade = facade(InMemoryBackend::arc());
        facade.runtime().wire().unwrap();

        let err = facade.submit_job("  ", &serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));
        assert!(!err.is_rejection());
    }

    #[tokio::test]
    async fn lookup_follows_the_returned_id() {
        let backend = InMemoryBackend::arc();
        let facade = facade(backend.clone());
        facade.runtime().wire().unwrap();

        let primary = facade.submit_job("createOrder", &serde_json::json!({"id": 1})).await.unwrap();
        assert!(!primary.job_id.is_fallback());
        let view = facade.get_job(&primary.job_id).await.unwrap().unwrap();
        assert_eq!(view.location(), "primary");

        backend.set_reachable(false);
        let parked = facade.submit_job("createOrder", &serde_json::json!({"id": 2})).await.unwrap();
        assert!(parked.job_id.is_fallback());
        let view = facade.get_job(&parked.job_id).await.unwrap().unwrap();
        assert_eq!(view.location(), "fallback");

        let status = facade.status().await;
        assert!(status.primary.error);
        assert_eq!(status.fallback.pending, 1);
        assert!(!status.fallback.processing);
    }

    #[tokio::test]
    async fn lookup_skips_an_unreachable_queue() {
        let operations = InMemoryBackend::arc();
        let database = InMemoryBackend::arc();
        let fast = PrimaryConfig::operations().with_policy(RetryPolicy::fixed(0, Duration::ZERO));
        let runtime = QueueRuntime::builder(QueueConfig::default().with_operations(fast))
            .operations_backend(operations.clone())
            .database_backend(database.clone())
            .store(InMemoryFallbackStore::arc())
            .build();
        let facade = JobFacade::new(Arc::new(runtime));
        facade.runtime().wire().unwrap();

        let receipt = facade
            .submit_to(QueueKind::Database, "createLot", &serde_json::json!({"lot": 7}), SubmitOptions::default())
            .await
            .unwrap();
        operations.set_reachable(false);

        let view = facade.get_job(&receipt.job_id).await.unwrap().unwrap();
        assert_eq!(view.location(), "primary");

        let err = facade.get_job(&JobId::primary()).await.unwrap_err();
        assert!(matches!(err, QueueError::Lookup(_)));
        assert!(!err.is_rejection());

        operations.set_reachable(true);
        assert!(facade.get_job(&JobId::primary()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unreadable_store_is_flagged_in_status() {
        struct Unreadable;

        #[async_trait::async_trait]
        impl crate::store::FallbackStore for Unreadable {
            async fn load(&self) -> Result<Vec<FallbackJob>, crate::error::StoreError> {
                Err(crate::error::StoreError::Corrupt("truncated".into()))
            }
            async fn save_all(&self, _: &[FallbackJob]) -> Result<(), crate::error::StoreError> {
                Ok(())
            }
        }

        let runtime = QueueRuntime::builder(QueueConfig::default())
            .store(Arc::new(Unreadable))
            .build();
        let facade = JobFacade::new(Arc::new(runtime));

        let status = facade.status().await;
        assert!(status.fallback.error);
        assert_eq!(status.fallback.pending, 0);
        assert!(!status.primary.error);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["fallback"]["error"], true);
    }

    #[tokio::test]
    async fn database_queue_failures_propagate() {
        let db_backend = InMemoryBackend::arc();
        db_backend.set_reachable(false);
        let fast = PrimaryConfig::database().with_policy(RetryPolicy::fixed(0, Duration::ZERO));
        let runtime = QueueRuntime::builder(QueueConfig::default().with_database(fast))
            .database_backend(db_backend)
            .store(InMemoryFallbackStore::arc())
            .build();
        let facade = JobFacade::new(Arc::new(runtime));
        facade.runtime().wire().unwrap();

        let err = facade
            .submit_to(QueueKind::Database, "createLot", &serde_json::json!({}), SubmitOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_rejection());
        assert_eq!(facade.runtime().fallback().pending_count().await.unwrap(), 0);
    }
}
