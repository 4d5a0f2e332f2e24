//! Fallback queue: durable last-resort holding area plus its recovery loop.
//!
//! ## Drain pass
//!
//! ```text
//! snapshot = load()                        (store lock held)
//!   ↓
//! for job in snapshot, oldest first:       (store lock released)
//!     primary.submit_direct(job)
//!       ok   → job leaves the store
//!       err  → attempts += 1, dropped once attempts >= max_attempts
//!   ↓
//! save_all(remaining ++ appended meanwhile) (store lock held)
//! ```
//!
//! Jobs appended by `add_fallback_job` while the pass was submitting are merged
//! back before the single overwrite, so they are never lost. A dropped job is
//! gone for good; that is the bounded-retry policy, reported at error level.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Notify, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use mfgmon_core::{JobId, JobName};

use crate::config::FallbackConfig;
use crate::error::{QueueError, StoreError};
use crate::primary::JobSubmitter;
use crate::store::FallbackStore;
use crate::types::{FallbackJob, SubmitOptions};

/// Where the primary queue parks jobs it could not accept.
#[async_trait]
pub trait FallbackSink: Send + Sync {
    async fn add_fallback_job(&self, name: JobName, payload: Value) -> Result<JobId, QueueError>;
}

/// Result of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Jobs read from the store at the start of the pass
    pub considered: usize,
    /// Jobs handed back to the primary queue
    pub resubmitted: usize,
    /// Jobs dropped after reaching the attempt ceiling
    pub dropped: Vec<JobId>,
    /// Jobs left in the store afterwards
    pub remaining: usize,
}

/// What a call to [`FallbackQueue::process_fallback_jobs`] did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum DrainOutcome {
    /// Another pass was in flight; this call did nothing.
    AlreadyRunning,
    /// No primary queue is registered (or it was dropped); the store is untouched.
    NotWired,
    Completed(DrainReport),
}

#[derive(Debug)]
struct DrainWorker {
    shutdown: Arc<Notify>,
    join: JoinHandle<()>,
}

/// Resets the in-flight flag however the pass ends.
struct PassGuard<'a>(&'a AtomicBool);

impl<'a> PassGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Durable fallback queue.
pub struct FallbackQueue {
    store: Arc<dyn FallbackStore>,
    config: FallbackConfig,
    primary: RwLock<Option<Weak<dyn JobSubmitter>>>,
    /// Serializes every store access made by this instance.
    store_lock: Arc<tokio::sync::Mutex<()>>,
    in_flight: AtomicBool,
    worker: Mutex<Option<DrainWorker>>,
}

impl std::fmt::Debug for FallbackQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackQueue")
            .field("config", &self.config)
            .field("in_flight", &self.is_draining())
            .field("scheduled", &self.is_scheduled())
            .finish_non_exhaustive()
    }
}

impl FallbackQueue {
    pub fn new(store: Arc<dyn FallbackStore>, config: FallbackConfig) -> Self {
        Self {
            store,
            config,
            primary: RwLock::new(None),
            store_lock: Arc::new(tokio::sync::Mutex::new(())),
            in_flight: AtomicBool::new(false),
            worker: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &FallbackConfig {
        &self.config
    }

    /// Late-bound primary registration.
    ///
    /// Only a weak reference is kept so the primary/fallback pair does not
    /// form a reference cycle.
    pub fn register_primary(&self, primary: &Arc<dyn JobSubmitter>) {
        *self.primary.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::downgrade(primary));
        info!("operations queue registered with fallback queue");
    }

    pub fn has_primary(&self) -> bool {
        self.primary().is_some()
    }

    fn primary(&self) -> Option<Arc<dyn JobSubmitter>> {
        self.primary
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
    }

    /// True while a drain pass is running.
    pub fn is_draining(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Park a job. Fails only when the store cannot be read or written.
    pub async fn add_fallback_job(&self, name: JobName, payload: Value) -> Result<JobId, QueueError> {
        let job = FallbackJob::new(name, payload);
        let id = job.id.clone();

        let result = async {
            let lock = self.lock_store().await?;
            let mut jobs = self.load().await?;
            jobs.push(job.clone());
            self.save(lock, jobs, Some(id.clone())).await
        }
        .await;

        match result {
            Ok(()) => {
                info!(job_id = %id, job_name = %job.name, "added job to fallback queue");
                Ok(id)
            }
            Err(err) => {
                error!(job_name = %job.name, error = %err, "failed to add job to fallback queue");
                Err(err.into())
            }
        }
    }

    /// Jobs currently parked, oldest first.
    pub async fn pending_jobs(&self) -> Result<Vec<FallbackJob>, QueueError> {
        let _lock = self.lock_store().await?;
        let mut jobs = self.load().await?;
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    pub async fn pending_count(&self) -> Result<usize, QueueError> {
        let _lock = self.lock_store().await?;
        Ok(self.load().await?.len())
    }

    pub async fn get_job(&self, id: &JobId) -> Result<Option<FallbackJob>, QueueError> {
        let _lock = self.lock_store().await?;
        Ok(self.load().await?.into_iter().find(|j| &j.id == id))
    }

    /// One drain pass. A call made while another pass is running is a no-op.
    pub async fn process_fallback_jobs(&self) -> Result<DrainOutcome, QueueError> {
        let Some(_pass) = PassGuard::acquire(&self.in_flight) else {
            debug!("fallback drain already in progress, skipping");
            return Ok(DrainOutcome::AlreadyRunning);
        };

        let Some(primary) = self.primary() else {
            warn!("no operations queue registered, skipping fallback drain");
            return Ok(DrainOutcome::NotWired);
        };

        let mut snapshot = {
            let _lock = self.lock_store().await?;
            self.load().await?
        };
        if snapshot.is_empty() {
            return Ok(DrainOutcome::Completed(DrainReport::default()));
        }
        snapshot.sort_by_key(|j| j.created_at);

        info!(count = snapshot.len(), "processing fallback jobs");

        let mut report = DrainReport {
            considered: snapshot.len(),
            ..Default::default()
        };
        let mut remaining = Vec::with_capacity(snapshot.len());

        for job in &snapshot {
            let result = primary
                .submit_direct(job.name.clone(), job.payload.clone(), SubmitOptions::default())
                .await;

            match result {
                Ok(primary_id) => {
                    info!(
                        job_id = %job.id,
                        primary_job_id = %primary_id,
                        job_name = %job.name,
                        "moved job from fallback to operations queue"
                    );
                    report.resubmitted += 1;
                }
                Err(err) => {
                    let mut job = job.clone();
                    job.attempts += 1;

                    if job.attempts >= self.config.max_attempts {
                        error!(
                            job_id = %job.id,
                            job_name = %job.name,
                            attempts = job.attempts,
                            error = %err,
                            "fallback job permanently dropped after reaching attempt ceiling"
                        );
                        report.dropped.push(job.id);
                    } else {
                        warn!(
                            job_id = %job.id,
                            job_name = %job.name,
                            attempts = job.attempts,
                            error = %err,
                            "failed to move fallback job to operations queue"
                        );
                        remaining.push(job);
                    }
                }
            }
        }

        {
            let lock = self.lock_store().await?;
            let seen: HashSet<&JobId> = snapshot.iter().map(|j| &j.id).collect();
            let appended: Vec<FallbackJob> = self
                .load()
                .await?
                .into_iter()
                .filter(|j| !seen.contains(&j.id))
                .collect();
            if !appended.is_empty() {
                debug!(count = appended.len(), "keeping jobs added during the drain pass");
            }
            remaining.extend(appended);
            report.remaining = remaining.len();
            self.save(lock, remaining, None).await?;
        }

        info!(
            considered = report.considered,
            processed = report.resubmitted + report.dropped.len(),
            resubmitted = report.resubmitted,
            dropped = report.dropped.len(),
            remaining = report.remaining,
            "fallback processing complete"
        );

        Ok(DrainOutcome::Completed(report))
    }

    /// Start the recurring drain task using the configured interval.
    pub fn start_processing(self: &Arc<Self>) {
        self.start_processing_every(self.config.drain_interval);
    }

    /// Start (or restart) the recurring drain task.
    ///
    /// A task that is already running is told to stop and replaced, so there
    /// is never more than one. Must be called inside a tokio runtime.
    pub fn start_processing_every(self: &Arc<Self>, interval: Duration) {
        let shutdown = Arc::new(Notify::new());
        let join = tokio::spawn(drain_loop(Arc::downgrade(self), interval, shutdown.clone()));

        let previous = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(DrainWorker { shutdown, join });
        if let Some(previous) = previous {
            previous.shutdown.notify_one();
        }

        info!(?interval, "fallback queue processing started");
    }

    /// Stop the recurring drain task. Safe to call when nothing is running.
    ///
    /// No new pass starts after this returns; a pass already in flight finishes.
    pub fn stop_processing(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            worker.shutdown.notify_one();
            info!("fallback queue processing stopped");
        }
    }

    /// Stop the recurring task and wait for it to exit.
    pub async fn shutdown(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            worker.shutdown.notify_one();
            let _ = worker.join.await;
            info!("fallback queue processing stopped");
        }
    }

    /// True while a recurring drain task is registered and alive.
    pub fn is_scheduled(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|w| !w.join.is_finished())
    }

    async fn lock_store(&self) -> Result<OwnedMutexGuard<()>, StoreError> {
        tokio::time::timeout(self.config.store_timeout, self.store_lock.clone().lock_owned())
            .await
            .map_err(|_| StoreError::Timeout(self.config.store_timeout))
    }

    async fn load(&self) -> Result<Vec<FallbackJob>, StoreError> {
        match tokio::time::timeout(self.config.store_timeout, self.store.load()).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.config.store_timeout)),
        }
    }

    /// Write `jobs` and release the store lock once the write has settled.
    ///
    /// The write runs as its own task. If it outlives `store_timeout` the
    /// caller gets `Timeout` at once, but the lock travels with the task, so
    /// no other store access starts until the late write lands. `added` names
    /// a job the caller is about to report as not accepted; if the late write
    /// succeeds anyway, that job is removed again.
    async fn save(
        &self,
        lock: OwnedMutexGuard<()>,
        jobs: Vec<FallbackJob>,
        added: Option<JobId>,
    ) -> Result<(), StoreError> {
        let store = self.store.clone();
        let mut write = tokio::spawn(async move { store.save_all(&jobs).await });

        match tokio::time::timeout(self.config.store_timeout, &mut write).await {
            Ok(joined) => joined.map_err(|e| StoreError::Task(e.to_string()))?,
            Err(_) => {
                warn!(
                    timeout = ?self.config.store_timeout,
                    "fallback store write timed out, holding the store until it settles"
                );
                tokio::spawn(settle_late_write(self.store.clone(), lock, write, added));
                Err(StoreError::Timeout(self.config.store_timeout))
            }
        }
    }
}

#[async_trait]
impl FallbackSink for FallbackQueue {
    async fn add_fallback_job(&self, name: JobName, payload: Value) -> Result<JobId, QueueError> {
        FallbackQueue::add_fallback_job(self, name, payload).await
    }
}

async fn settle_late_write(
    store: Arc<dyn FallbackStore>,
    _lock: OwnedMutexGuard<()>,
    write: JoinHandle<Result<(), StoreError>>,
    added: Option<JobId>,
) {
    match write.await {
        Ok(Ok(())) => {
            let Some(id) = added else {
                debug!("late fallback store write landed");
                return;
            };
            let rollback = async {
                let jobs = store.load().await?;
                let kept: Vec<FallbackJob> = jobs.into_iter().filter(|j| j.id != id).collect();
                store.save_all(&kept).await
            };
            match rollback.await {
                Ok(()) => warn!(job_id = %id, "removed fallback job whose write timed out"),
                Err(err) => error!(job_id = %id, error = %err, "could not remove fallback job whose write timed out"),
            }
        }
        Ok(Err(err)) => warn!(error = %err, "late fallback store write failed"),
        Err(err) => error!(error = %err, "fallback store write task failed"),
    }
}

async fn drain_loop(queue: Weak<FallbackQueue>, interval: Duration, shutdown: Arc<Notify>) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.notified() => break,
            _ = ticker.tick() => {
                let Some(queue) = queue.upgrade() else {
                    break;
                };
                match queue.process_fallback_jobs().await {
                    Ok(outcome) => debug!(?outcome, "fallback drain tick finished"),
                    Err(err) => error!(error = %err, "error in fallback job processing interval"),
                }
            }
        }
    }

    debug!("fallback drain task exited");
}
