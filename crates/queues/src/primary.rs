//! Primary queue: normal-path submission with bounded retry and fallback escalation.

use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use mfgmon_core::{JobId, JobName};

use crate::backend::ExecutionBackend;
use crate::config::PrimaryConfig;
use crate::error::{BackendError, QueueError};
use crate::fallback::FallbackSink;
use crate::types::{Job, JobRequest, QueueCounts, QueueKind, RetryPolicy, SubmitOptions};

/// Primary-only submission, as used by the fallback drain pass.
///
/// Implementations must never escalate to a fallback: a failure here is
/// reported back so the caller can count it.
#[async_trait]
pub trait JobSubmitter: Send + Sync {
    async fn submit_direct(
        &self,
        name: JobName,
        payload: Value,
        options: SubmitOptions,
    ) -> Result<JobId, QueueError>;
}

/// A primary queue in front of an execution backend.
pub struct PrimaryQueue {
    kind: QueueKind,
    backend: Arc<dyn ExecutionBackend>,
    config: PrimaryConfig,
    fallback: RwLock<Option<Arc<dyn FallbackSink>>>,
}

impl std::fmt::Debug for PrimaryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrimaryQueue")
            .field("kind", &self.kind)
            .field("config", &self.config)
            .field("has_fallback", &self.has_fallback())
            .finish_non_exhaustive()
    }
}

impl PrimaryQueue {
    pub fn new(kind: QueueKind, backend: Arc<dyn ExecutionBackend>, config: PrimaryConfig) -> Self {
        Self {
            kind,
            backend,
            config,
            fallback: RwLock::new(None),
        }
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    pub fn config(&self) -> &PrimaryConfig {
        &self.config
    }

    /// Late-bound fallback registration (breaks the construction cycle).
    pub fn register_fallback(&self, fallback: Arc<dyn FallbackSink>) {
        *self.fallback.write().unwrap_or_else(PoisonError::into_inner) = Some(fallback);
        info!(queue = %self.kind, "fallback queue registered with primary queue");
    }

    pub fn has_fallback(&self) -> bool {
        self.fallback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn fallback(&self) -> Option<Arc<dyn FallbackSink>> {
        self.fallback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Submit a job; returns as soon as some queue has accepted it.
    ///
    /// After the retry policy is exhausted the job goes to the registered
    /// fallback and the fallback id is returned. Without a fallback the last
    /// backend error propagates.
    pub async fn submit(
        &self,
        name: JobName,
        payload: Value,
        options: SubmitOptions,
    ) -> Result<JobId, QueueError> {
        let err = match self.try_submit(name.clone(), payload.clone(), &options).await {
            Ok(id) => return Ok(id),
            Err(err) => err,
        };

        let Some(fallback) = self.fallback() else {
            return Err(QueueError::Backend(err));
        };

        info!(queue = %self.kind, job_name = %name, "attempting to add job to fallback queue");
        match fallback.add_fallback_job(name.clone(), payload).await {
            Ok(id) => {
                info!(queue = %self.kind, job_name = %name, job_id = %id, "job added to fallback queue");
                Ok(id)
            }
            Err(fallback_err) => {
                error!(
                    queue = %self.kind,
                    job_name = %name,
                    primary_error = %err,
                    error = %fallback_err,
                    "failed to add job to fallback queue"
                );
                Err(fallback_err)
            }
        }
    }

    async fn try_submit(
        &self,
        name: JobName,
        payload: Value,
        options: &SubmitOptions,
    ) -> Result<JobId, BackendError> {
        let policy = self.config.resolve_policy(options);
        let request = JobRequest {
            queue: self.kind,
            name,
            payload,
            retry_policy: policy.clone(),
            submitted_at: Utc::now(),
        };

        let deadline = self.config.submit_deadline;
        match tokio::time::timeout(deadline, self.retry_loop(&request, &policy)).await {
            Ok(result) => result,
            Err(_) => {
                error!(
                    queue = %self.kind,
                    job_name = %request.name,
                    ?deadline,
                    "submission deadline passed, giving up"
                );
                Err(BackendError::Timeout(deadline))
            }
        }
    }

    async fn retry_loop(&self, request: &JobRequest, policy: &RetryPolicy) -> Result<JobId, BackendError> {
        let mut retries = 0;
        loop {
            let result = match tokio::time::timeout(
                self.config.submit_timeout,
                self.backend.submit(request.clone()),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(BackendError::Timeout(self.config.submit_timeout)),
            };

            match result {
                Ok(id) => {
                    debug!(queue = %self.kind, job_name = %request.name, job_id = %id, retries, "job added to queue");
                    return Ok(id);
                }
                Err(err) if policy.should_retry(retries) => {
                    retries += 1;
                    let delay = policy.delay_for_attempt(retries);
                    warn!(
                        queue = %self.kind,
                        job_name = %request.name,
                        error = %err,
                        retry = retries,
                        max_retries = policy.max_attempts,
                        ?delay,
                        "submission failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    error!(
                        queue = %self.kind,
                        job_name = %request.name,
                        error = %err,
                        retries,
                        "failed to add job to queue"
                    );
                    return Err(err);
                }
            }
        }
    }

    /// Look a job up. Unknown ids are `Ok(None)`.
    pub async fn get_job(&self, id: &JobId) -> Result<Option<Job>, BackendError> {
        match tokio::time::timeout(self.config.submit_timeout, self.backend.get_job(id)).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout(self.config.submit_timeout)),
        }
    }

    /// Queue depth; never fails (errors yield a zeroed, flagged snapshot).
    pub async fn status(&self) -> QueueCounts {
        let result = match tokio::time::timeout(self.config.submit_timeout, self.backend.counts()).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout(self.config.submit_timeout)),
        };

        result.unwrap_or_else(|err| {
            error!(queue = %self.kind, error = %err, "failed to get queue status");
            QueueCounts::errored()
        })
    }
}

#[async_trait]
impl JobSubmitter for PrimaryQueue {
    async fn submit_direct(
        &self,
        name: JobName,
        payload: Value,
        options: SubmitOptions,
    ) -> Result<JobId, QueueError> {
        Ok(self.try_submit(name, payload, &options).await?)
    }
}
