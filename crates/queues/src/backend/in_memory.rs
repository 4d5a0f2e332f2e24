//! In-memory execution backend for tests/dev.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use mfgmon_core::JobId;

use super::{DEFAULT_FAILED_RETENTION, ExecutionBackend, WorkSource};
use crate::error::BackendError;
use crate::types::{Job, JobRequest, JobStatus, QueueCounts};

#[derive(Debug, Default)]
struct Shelves {
    /// Every job not yet evicted
    jobs: HashMap<JobId, Job>,
    /// Claimable now, in submission order
    ready: VecDeque<JobId>,
    /// Waiting for their retry time
    delayed: BTreeSet<(DateTime<Utc>, JobId)>,
    /// Terminal failures, oldest first
    failed: VecDeque<JobId>,
    completed: u64,
}

impl Shelves {
    fn promote_due(&mut self, now: DateTime<Utc>) {
        while self.delayed.first().is_some_and(|(at, _)| *at <= now) {
            if let Some((_, id)) = self.delayed.pop_first() {
                self.ready.push_back(id);
            }
        }
    }
}

/// In-memory backend.
///
/// Completed jobs are evicted and only counted; failed jobs are kept up to a
/// retention limit. `set_reachable(false)` simulates a broker outage: every
/// call fails with [`BackendError::Unavailable`] until it is flipped back.
#[derive(Debug)]
pub struct InMemoryBackend {
    shelves: Mutex<Shelves>,
    failed_retention: usize,
    reachable: AtomicBool,
    submitted: Notify,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            shelves: Mutex::new(Shelves::default()),
            failed_retention: DEFAULT_FAILED_RETENTION,
            reachable: AtomicBool::new(true),
            submitted: Notify::new(),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn with_failed_retention(mut self, limit: usize) -> Self {
        self.failed_retention = limit;
        self
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    /// Resolves after the next successful submission.
    pub async fn submitted(&self) {
        self.submitted.notified().await;
    }

    /// Claim the oldest job that is ready to execute and mark it active.
    pub fn claim_next(&self) -> Option<Job> {
        let mut shelves = self.lock();
        shelves.promote_due(Utc::now());

        while let Some(id) = shelves.ready.pop_front() {
            if let Some(job) = shelves.jobs.get_mut(&id) {
                job.mark_active();
                return Some(job.clone());
            }
        }
        None
    }

    /// Write back a job the worker has finished with.
    pub fn update(&self, job: &Job) -> Result<(), BackendError> {
        let mut shelves = self.lock();
        if !shelves.jobs.contains_key(&job.id) {
            return Err(BackendError::Command(format!("job not found: {}", job.id)));
        }

        match &job.status {
            JobStatus::Completed => {
                shelves.jobs.remove(&job.id);
                shelves.completed += 1;
                return Ok(());
            }
            JobStatus::Failed { .. } => {
                shelves.failed.push_back(job.id.clone());
                while shelves.failed.len() > self.failed_retention {
                    if let Some(evicted) = shelves.failed.pop_front() {
                        shelves.jobs.remove(&evicted);
                    }
                }
            }
            JobStatus::Delayed { .. } => {
                let at = job.scheduled_at.unwrap_or_else(Utc::now);
                shelves.delayed.insert((at, job.id.clone()));
            }
            JobStatus::Waiting => shelves.ready.push_back(job.id.clone()),
            JobStatus::Active => {}
        }

        if let Some(slot) = shelves.jobs.get_mut(&job.id) {
            *slot = job.clone();
        }
        Ok(())
    }

    /// Jobs still held (completed ones are gone).
    pub fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_reachable(&self) -> Result<(), BackendError> {
        if self.is_reachable() {
            Ok(())
        } else {
            Err(BackendError::Unavailable("in-memory backend marked unreachable".into()))
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shelves> {
        self.shelves.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionBackend for InMemoryBackend {
    async fn submit(&self, request: JobRequest) -> Result<JobId, BackendError> {
        self.ensure_reachable()?;

        let id = JobId::primary();
        let job = Job::from_request(id.clone(), request);
        {
            let mut shelves = self.lock();
            shelves.jobs.insert(id.clone(), job);
            shelves.ready.push_back(id.clone());
        }
        self.submitted.notify_waiters();
        Ok(id)
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>, BackendError> {
        self.ensure_reachable()?;
        Ok(self.lock().jobs.get(id).cloned())
    }

    async fn counts(&self) -> Result<QueueCounts, BackendError> {
        self.ensure_reachable()?;

        let shelves = self.lock();
        let mut counts = QueueCounts {
            completed: shelves.completed,
            ..Default::default()
        };
        for job in shelves.jobs.values() {
            match &job.status {
                JobStatus::Waiting => counts.waiting += 1,
                JobStatus::Active => counts.active += 1,
                JobStatus::Delayed { .. } => counts.delayed += 1,
                JobStatus::Failed { .. } => counts.failed += 1,
                JobStatus::Completed => {}
            }
        }
        Ok(counts)
    }
}

#[async_trait]
impl WorkSource for InMemoryBackend {
    async fn claim(&self) -> Result<Option<Job>, BackendError> {
        Ok(self.claim_next())
    }

    async fn finish(&self, job: &Job) -> Result<(), BackendError> {
        self.update(job)
    }

    async fn wait_for_work(&self, idle: Duration) {
        tokio::select! {
            _ = self.submitted() => {}
            _ = tokio::time::sleep(idle) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{QueueKind, RetryPolicy};
    use mfgmon_core::JobName;

    fn request(name: &str) -> JobRequest {
        JobRequest {
            queue: QueueKind::Operations,
            name: JobName::new(name).unwrap(),
            payload: serde_json::json!({}),
            retry_policy: RetryPolicy::no_retry(),
            submitted_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn submit_and_claim_in_order() {
        let backend = InMemoryBackend::new();

        let first = backend.submit(request("createCustomer")).await.unwrap();
        let second = backend.submit(request("createOrder")).await.unwrap();

        assert_eq!(backend.claim_next().unwrap().id, first);
        assert_eq!(backend.claim_next().unwrap().id, second);
        assert!(backend.claim_next().is_none());

        let counts = backend.counts().await.unwrap();
        assert_eq!(counts.active, 2);
        assert_eq!(counts.waiting, 0);
    }

    #[tokio::test]
    async fn unreachable_backend_rejects_everything() {
        let backend = InMemoryBackend::new();
        backend.set_reachable(false);

        assert!(matches!(
            backend.submit(request("createLot")).await,
            Err(BackendError::Unavailable(_))
        ));
        assert!(backend.counts().await.is_err());
        assert!(backend.is_empty());

        backend.set_reachable(true);
        assert!(backend.submit(request("createLot")).await.is_ok());
    }

    #[tokio::test]
    async fn completed_jobs_are_evicted_and_counted() {
        let backend = InMemoryBackend::new();
        let id = backend.submit(request("createMachine")).await.unwrap();

        let mut job = backend.claim_next().unwrap();
        job.mark_completed();
        backend.update(&job).unwrap();

        assert!(backend.get_job(&id).await.unwrap().is_none());
        assert!(backend.is_empty());
        assert_eq!(backend.counts().await.unwrap().completed, 1);

        assert!(backend.update(&job).is_err());
        let stray = Job::from_request(JobId::primary(), request("createMachine"));
        assert!(backend.update(&stray).is_err());
    }

    #[tokio::test]
    async fn failed_jobs_are_retained_up_to_the_limit() {
        let backend = InMemoryBackend::new().with_failed_retention(2);

        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(backend.submit(request("createLot")).await.unwrap());
            let mut job = backend.claim_next().unwrap();
            job.mark_failed("no such line".into());
            backend.update(&job).unwrap();
        }

        assert!(backend.get_job(&ids[0]).await.unwrap().is_none());
        assert!(backend.get_job(&ids[2]).await.unwrap().is_some());
        assert_eq!(backend.counts().await.unwrap().failed, 2);
    }

    #[tokio::test]
    async fn delayed_jobs_wait_for_their_time() {
        let backend = InMemoryBackend::new();
        let mut req = request("createOrder");
        req.retry_policy = RetryPolicy::fixed(1, Duration::from_secs(3600));
        backend.submit(req).await.unwrap();

        let mut job = backend.claim_next().unwrap();
        job.mark_failed("line busy".into());
        backend.update(&job).unwrap();

        assert!(backend.claim_next().is_none());
        assert_eq!(backend.counts().await.unwrap().delayed, 1);
    }

    #[tokio::test]
    async fn memory_stays_flat_under_a_steady_stream() {
        let backend = InMemoryBackend::new();
        for _ in 0..500 {
            backend.submit(request("recordTelemetry")).await.unwrap();
            let mut job = backend.claim_next().unwrap();
            job.mark_completed();
            backend.update(&job).unwrap();
        }

        assert!(backend.is_empty());
        assert_eq!(backend.counts().await.unwrap().completed, 500);
    }
}
