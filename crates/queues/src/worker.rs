//! Local job worker.
//!
//! Claims ready jobs from a [`WorkSource`], runs the handler registered for the
//! job name and writes the outcome back. Execution retries follow the job's own
//! retry policy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backend::WorkSource;
use crate::types::Job;

/// Outcome a handler reports for one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    Success,
    /// Failed; retried per the job's policy
    Failure(String),
    /// Failed; retry no earlier than the given delay
    RetryAfter(Duration),
}

pub type JobHandler = Box<dyn Fn(&Job) -> JobResult + Send + Sync>;

#[derive(Debug, Clone)]
pub struct JobWorkerConfig {
    /// Sleep between polls when nothing is ready
    pub poll_interval: Duration,
    pub name: String,
}

impl Default for JobWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            name: "job-worker".to_string(),
        }
    }
}

impl JobWorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub uptime_secs: u64,
}

/// Handle to a running worker.
#[derive(Debug)]
pub struct JobWorkerHandle {
    shutdown: Arc<Notify>,
    join: JoinHandle<()>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl JobWorkerHandle {
    /// Stop after the job in progress (if any) and wait for the task.
    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        if let Err(err) = self.join.await {
            error!(error = %err, "job worker task failed");
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Executes jobs held by a backend.
pub struct JobWorker {
    source: Arc<dyn WorkSource>,
    handlers: HashMap<String, JobHandler>,
}

impl JobWorker {
    pub fn new(source: Arc<dyn WorkSource>) -> Self {
        Self {
            source,
            handlers: HashMap::new(),
        }
    }

    /// Register a handler by exact name, `"prefix.*"` or `"*"`.
    pub fn register_handler<F>(&mut self, pattern: impl Into<String>, handler: F)
    where
        F: Fn(&Job) -> JobResult + Send + Sync + 'static,
    {
        self.handlers.insert(pattern.into(), Box::new(handler));
    }

    fn handler_for(&self, name: &str) -> Option<&JobHandler> {
        if let Some(h) = self.handlers.get(name) {
            return Some(h);
        }

        let prefixed = self.handlers.iter().find(|(pattern, _)| {
            pattern
                .strip_suffix(".*")
                .is_some_and(|prefix| name.starts_with(prefix) && name[prefix.len()..].starts_with('.'))
        });
        if let Some((_, h)) = prefixed {
            return Some(h);
        }

        self.handlers.get("*")
    }

    /// Run one claimed job to its next state and write it back.
    pub async fn execute_one(&self, job: &mut Job) -> Result<(), String> {
        let outcome = match self.handler_for(job.name.as_str()) {
            Some(handler) => handler(job),
            None => {
                let error = format!("no handler for job: {}", job.name);
                warn!(job_id = %job.id, job_name = %job.name, "no handler for job");
                job.mark_failed(error.clone());
                self.write_back(job).await?;
                return Err(error);
            }
        };

        match outcome {
            JobResult::Success => {
                job.mark_completed();
                self.write_back(job).await?;
                Ok(())
            }
            JobResult::Failure(error) => {
                job.mark_failed(error.clone());
                self.write_back(job).await?;
                Err(error)
            }
            JobResult::RetryAfter(delay) => {
                let error = "retry after delay".to_string();
                job.mark_failed_with_delay(error.clone(), Some(delay));
                self.write_back(job).await?;
                Err(error)
            }
        }
    }

    async fn write_back(&self, job: &Job) -> Result<(), String> {
        self.source.finish(job).await.map_err(|e| e.to_string())
    }

    /// Spawn the polling loop on the current tokio runtime.
    pub fn spawn(self, config: JobWorkerConfig) -> JobWorkerHandle {
        let shutdown = Arc::new(Notify::new());
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let join = tokio::spawn(worker_loop(self, config, shutdown.clone(), stats.clone()));

        JobWorkerHandle {
            shutdown,
            join,
            stats,
        }
    }
}

async fn worker_loop(
    worker: JobWorker,
    config: JobWorkerConfig,
    shutdown: Arc<Notify>,
    stats: Arc<Mutex<WorkerStats>>,
) {
    info!(worker = %config.name, "job worker started");
    let started = Instant::now();

    loop {
        let claimed = match worker.source.claim().await {
            Ok(claimed) => claimed,
            Err(err) => {
                warn!(worker = %config.name, error = %err, "failed to claim job");
                None
            }
        };

        if let Some(mut job) = claimed {
            debug!(worker = %config.name, job_id = %job.id, job_name = %job.name, "claimed job");
            let result = worker.execute_one(&mut job).await;

            {
                let mut s = stats.lock().unwrap_or_else(PoisonError::into_inner);
                s.uptime_secs = started.elapsed().as_secs();
                s.jobs_processed += 1;
                match &result {
                    Ok(()) => s.jobs_succeeded += 1,
                    Err(_) => s.jobs_failed += 1,
                }
            }

            if let Err(e) = result {
                debug!(
                    worker = %config.name,
                    job_id = %job.id,
                    error = %e,
                    status = ?job.status,
                    "job execution failed"
                );
            }

            tokio::task::yield_now().await;
            continue;
        }

        tokio::select! {
            biased;
            _ = shutdown.notified() => break,
            _ = worker.source.wait_for_work(config.poll_interval) => {}
        }
    }

    info!(worker = %config.name, "job worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ExecutionBackend, InMemoryBackend};
    use crate::types::{JobRequest, JobStatus, QueueKind, RetryPolicy};
    use chrono::Utc;
    use mfgmon_core::JobName;

    fn request(name: &str, retries: u32) -> JobRequest {
        JobRequest {
            queue: QueueKind::Operations,
            name: JobName::new(name).unwrap(),
            payload: serde_json::json!({}),
            retry_policy: RetryPolicy::fixed(retries, Duration::ZERO),
            submitted_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn handler_selection_prefers_exact_then_prefix_then_wildcard() {
        let backend = InMemoryBackend::arc();
        let mut worker = JobWorker::new(backend.clone());
        worker.register_handler("machine.create", |_| JobResult::Success);
        worker.register_handler("machine.*", |_| JobResult::Failure("prefix".into()));
        worker.register_handler("*", |_| JobResult::Failure("wildcard".into()));

        for (name, expected) in [
            ("machine.create", Ok(())),
            ("machine.delete", Err("prefix".to_string())),
            ("machinery", Err("wildcard".to_string())),
        ] {
            backend.submit(request(name, 0)).await.unwrap();
            let mut job = backend.claim_next().unwrap();
            assert_eq!(worker.execute_one(&mut job).await, expected, "{name}");
        }
    }

    #[tokio::test]
    async fn missing_handler_fails_the_job() {
        let backend = InMemoryBackend::arc();
        let worker = JobWorker::new(backend.clone());

        let id = backend.submit(request("createLot", 0)).await.unwrap();
        let mut job = backend.claim_next().unwrap();
        assert!(worker.execute_one(&mut job).await.is_err());

        let stored = backend.get_job(&id).await.unwrap().unwrap();
        assert!(matches!(stored.status, JobStatus::Failed { .. }));
    }

    #[tokio::test]
    async fn failures_are_retried_per_policy() {
        let backend = InMemoryBackend::arc();
        let mut worker = JobWorker::new(backend.clone());
        worker.register_handler("createOrder", |_| JobResult::Failure("db down".into()));

        let id = backend.submit(request("createOrder", 1)).await.unwrap();

        let mut job = backend.claim_next().unwrap();
        let _ = worker.execute_one(&mut job).await;
        assert!(matches!(job.status, JobStatus::Delayed { .. }));

        let mut job = backend.claim_next().unwrap();
        let _ = worker.execute_one(&mut job).await;
        let stored = backend.get_job(&id).await.unwrap().unwrap();
        assert_eq!(
            stored.status,
            JobStatus::Failed {
                error: "db down".into(),
                attempts: 2
            }
        );
    }

    #[tokio::test]
    async fn spawned_worker_completes_submitted_jobs() {
        let backend = InMemoryBackend::arc();
        let mut worker = JobWorker::new(backend.clone());
        worker.register_handler("*", |_| JobResult::Success);
        let handle = worker.spawn(JobWorkerConfig::default().with_poll_interval(Duration::from_millis(5)));

        let id = backend.submit(request("createFacility", 0)).await.unwrap();

        let counted = tokio::time::timeout(Duration::from_secs(2), async {
            while handle.stats().jobs_succeeded < 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(counted.is_ok());
        assert!(backend.get_job(&id).await.unwrap().is_none());
        assert_eq!(backend.counts().await.unwrap().completed, 1);

        handle.shutdown().await;
    }
}
