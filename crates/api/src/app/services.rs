//! Service wiring: picks the execution backends and builds the queue runtime.

use std::sync::Arc;

use tracing::info;

use mfgmon_queues::{
    InMemoryBackend, JobFacade, JobResult, JobWorker, JobWorkerConfig, QueueConfig, QueueKind,
    QueueRuntime, WorkSource,
};

/// Everything the HTTP handlers need.
#[derive(Debug, Clone)]
pub struct AppServices {
    pub facade: JobFacade,
}

impl AppServices {
    pub fn new(runtime: Arc<QueueRuntime>) -> Self {
        Self {
            facade: JobFacade::new(runtime),
        }
    }

    pub fn runtime(&self) -> &Arc<QueueRuntime> {
        self.facade.runtime()
    }
}

/// Build the queue runtime from configuration and start it.
///
/// With `REDIS_URL` set (and the `redis` feature on) both primary queues use
/// Redis; otherwise they use in-memory backends. Either way each queue gets a
/// local worker.
pub fn build_services(config: QueueConfig) -> anyhow::Result<AppServices> {
    let runtime = match config.redis_url.clone() {
        Some(url) => build_redis_runtime(config, &url)?,
        None => build_in_memory_runtime(config),
    };

    let runtime = Arc::new(runtime);
    runtime.start();
    Ok(AppServices::new(runtime))
}

fn build_in_memory_runtime(config: QueueConfig) -> QueueRuntime {
    let operations = InMemoryBackend::arc();
    let database = InMemoryBackend::arc();

    let runtime = QueueRuntime::builder(config)
        .operations_backend(operations.clone())
        .database_backend(database.clone())
        .build();

    attach_workers(&runtime, operations, database);

    info!("using in-memory execution backends");
    runtime
}

fn attach_workers(runtime: &QueueRuntime, operations: Arc<dyn WorkSource>, database: Arc<dyn WorkSource>) {
    for (kind, source) in [(QueueKind::Operations, operations), (QueueKind::Database, database)] {
        runtime.attach_worker(logging_worker(source).spawn(
            JobWorkerConfig::default().with_name(format!("{kind}-worker")),
        ));
    }
}

/// Worker that acknowledges every job; real handlers live with the consumers.
fn logging_worker(source: Arc<dyn WorkSource>) -> JobWorker {
    let mut worker = JobWorker::new(source);
    worker.register_handler("*", |job| {
        info!(job_id = %job.id, job_name = %job.name, queue = %job.queue, "processed job");
        JobResult::Success
    });
    worker
}

#[cfg(feature = "redis")]
fn build_redis_runtime(config: QueueConfig, url: &str) -> anyhow::Result<QueueRuntime> {
    use mfgmon_queues::backend::RedisBackend;

    let operations = Arc::new(RedisBackend::new(url, QueueKind::Operations)?);
    let database = Arc::new(RedisBackend::new(url, QueueKind::Database)?);

    let runtime = QueueRuntime::builder(config)
        .operations_backend(operations.clone())
        .database_backend(database.clone())
        .build();
    attach_workers(&runtime, operations, database);

    info!("using redis execution backends");
    Ok(runtime)
}

#[cfg(not(feature = "redis"))]
fn build_redis_runtime(config: QueueConfig, _url: &str) -> anyhow::Result<QueueRuntime> {
    tracing::warn!("REDIS_URL is set but the redis feature is not enabled, falling back to in-memory");
    Ok(build_in_memory_runtime(config))
}
