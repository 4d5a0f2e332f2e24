//! Queue wiring and lifecycle.
//!
//! The primary and fallback queues need each other, so neither can take the
//! other as a constructor argument. [`QueueRuntime`] builds both unwired, then
//! `wire()` registers each with the other exactly once and flips the readiness
//! flag the facade checks before accepting work.

use std::sync::{Arc, Mutex, PoisonError};
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;
use tracing::{debug, info};

use crate::backend::{ExecutionBackend, InMemoryBackend};
use crate::config::QueueConfig;
use crate::error::WiringError;
use crate::fallback::{FallbackQueue, FallbackSink};
use crate::primary::{JobSubmitter, PrimaryQueue};
use crate::store::{FallbackStore, FileFallbackStore};
use crate::types::QueueKind;
use crate::worker::JobWorkerHandle;

/// Readiness flag that can be polled or awaited.
#[derive(Debug, Clone)]
pub struct ReadyFlag {
    tx: Arc<watch::Sender<bool>>,
}

impl ReadyFlag {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn is_ready(&self) -> bool {
        *self.tx.borrow()
    }

    fn mark_ready(&self) {
        self.tx.send_replace(true);
    }

    /// Resolves once the flag is set (immediately if it already is).
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|ready| *ready).await;
    }
}

impl Default for ReadyFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Application-lifetime owner of the queues.
#[derive(Debug)]
pub struct QueueRuntime {
    operations: Arc<PrimaryQueue>,
    database: Arc<PrimaryQueue>,
    fallback: Arc<FallbackQueue>,
    wired: AtomicBool,
    ready: ReadyFlag,
    workers: Mutex<Vec<JobWorkerHandle>>,
}

impl QueueRuntime {
    pub fn builder(config: QueueConfig) -> QueueRuntimeBuilder {
        QueueRuntimeBuilder {
            config,
            operations_backend: None,
            database_backend: None,
            store: None,
        }
    }

    /// Construct the queues without connecting them.
    pub fn new(
        config: &QueueConfig,
        operations_backend: Arc<dyn ExecutionBackend>,
        database_backend: Arc<dyn ExecutionBackend>,
        store: Arc<dyn FallbackStore>,
    ) -> Self {
        Self {
            operations: Arc::new(PrimaryQueue::new(
                QueueKind::Operations,
                operations_backend,
                config.operations.clone(),
            )),
            database: Arc::new(PrimaryQueue::new(
                QueueKind::Database,
                database_backend,
                config.database.clone(),
            )),
            fallback: Arc::new(FallbackQueue::new(store, config.fallback.clone())),
            wired: AtomicBool::new(false),
            ready: ReadyFlag::new(),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Connect the operations queue and the fallback queue. Runs once.
    ///
    /// The database queue deliberately has no fallback.
    pub fn wire(&self) -> Result<(), WiringError> {
        if self
            .wired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(WiringError::AlreadyWired);
        }

        let fallback: Arc<dyn FallbackSink> = self.fallback.clone();
        self.operations.register_fallback(fallback);

        let primary: Arc<dyn JobSubmitter> = self.operations.clone();
        self.fallback.register_primary(&primary);

        self.ready.mark_ready();
        info!("queue wiring completed");
        Ok(())
    }

    /// Wire (if not done yet) and start the fallback drain loop.
    pub fn start(&self) {
        if self.wire().is_err() {
            debug!("queues already wired");
        }
        self.fallback.start_processing();
    }

    /// Hand a local worker to the runtime so `shutdown` stops it too.
    pub fn attach_worker(&self, worker: JobWorkerHandle) {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(worker);
    }

    /// Stop the drain task and attached workers, waiting for them to exit.
    pub async fn shutdown(&self) {
        self.fallback.shutdown().await;

        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for worker in workers {
            worker.shutdown().await;
        }
        info!("queue runtime shut down");
    }

    pub fn is_ready(&self) -> bool {
        self.ready.is_ready()
    }

    pub async fn wait_ready(&self) {
        self.ready.wait().await;
    }

    pub fn ready_flag(&self) -> ReadyFlag {
        self.ready.clone()
    }

    pub fn queue(&self, kind: QueueKind) -> &Arc<PrimaryQueue> {
        match kind {
            QueueKind::Operations => &self.operations,
            QueueKind::Database => &self.database,
        }
    }

    pub fn operations(&self) -> &Arc<PrimaryQueue> {
        &self.operations
    }

    pub fn database(&self) -> &Arc<PrimaryQueue> {
        &self.database
    }

    pub fn fallback(&self) -> &Arc<FallbackQueue> {
        &self.fallback
    }
}

/// Builder filling unset collaborators with in-memory backends and the file store.
pub struct QueueRuntimeBuilder {
    config: QueueConfig,
    operations_backend: Option<Arc<dyn ExecutionBackend>>,
    database_backend: Option<Arc<dyn ExecutionBackend>>,
    store: Option<Arc<dyn FallbackStore>>,
}

impl QueueRuntimeBuilder {
    pub fn operations_backend(mut self, backend: Arc<dyn ExecutionBackend>) -> Self {
        self.operations_backend = Some(backend);
        self
    }

    pub fn database_backend(mut self, backend: Arc<dyn ExecutionBackend>) -> Self {
        self.database_backend = Some(backend);
        self
    }

    pub fn store(mut self, store: Arc<dyn FallbackStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> QueueRuntime {
        let operations = self
            .operations_backend
            .unwrap_or_else(|| InMemoryBackend::arc() as Arc<dyn ExecutionBackend>);
        let database = self
            .database_backend
            .unwrap_or_else(|| InMemoryBackend::arc() as Arc<dyn ExecutionBackend>);
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(FileFallbackStore::new(&self.config.fallback_path)) as Arc<dyn FallbackStore>);

        QueueRuntime::new(&self.config, operations, database, store)
    }
}
