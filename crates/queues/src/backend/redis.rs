//! Redis-backed execution backend.
//!
//! Key layout (prefix defaults to `mfgmon:queue:<queue>`):
//! - `<prefix>:job:<id>`: the job record as JSON (deleted once completed)
//! - `<prefix>:wait`: LIST of claimable ids (LPUSH by producers)
//! - `<prefix>:active`: LIST of ids being executed (RPOPLPUSH from `wait`)
//! - `<prefix>:delayed`: ZSET of ids scored by their retry time (unix millis)
//! - `<prefix>:failed`: ZSET of terminally failed ids scored by failure time
//! - `<prefix>:completed`: counter of completed jobs
//!
//! The layout is private to this crate; a local
//! [`JobWorker`](crate::worker::JobWorker) drains it through [`WorkSource`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use mfgmon_core::JobId;

use super::{DEFAULT_FAILED_RETENTION, ExecutionBackend, WorkSource};
use crate::error::BackendError;
use crate::types::{Job, JobRequest, JobStatus, QueueCounts, QueueKind};

#[derive(Debug, Clone)]
pub struct RedisBackend {
    client: Arc<::redis::Client>,
    prefix: String,
    failed_retention: usize,
}

impl RedisBackend {
    /// Create a backend for one queue.
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    pub fn new(redis_url: impl AsRef<str>, queue: QueueKind) -> Result<Self, BackendError> {
        let client = ::redis::Client::open(redis_url.as_ref())
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            prefix: format!("mfgmon:queue:{}", queue.as_str()),
            failed_retention: DEFAULT_FAILED_RETENTION,
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_failed_retention(mut self, limit: usize) -> Self {
        self.failed_retention = limit;
        self
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.prefix, suffix)
    }

    fn job_key(&self, id: &str) -> String {
        self.key(&format!("job:{id}"))
    }

    /// Run a blocking redis call off the async workers.
    async fn blocking<T, F>(&self, f: F) -> Result<T, BackendError>
    where
        T: Send + 'static,
        F: FnOnce(&mut ::redis::Connection, &RedisBackend) -> Result<T, BackendError> + Send + 'static,
    {
        let this = self.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = this
                .client
                .get_connection()
                .map_err(|e| BackendError::Unavailable(e.to_string()))?;
            f(&mut conn, &this)
        })
        .await
        .map_err(|e| BackendError::Command(format!("redis task failed: {e}")))?
    }

    /// Move delayed jobs whose time has come back onto `wait`.
    fn promote_due(&self, conn: &mut ::redis::Connection, now: DateTime<Utc>) -> Result<(), BackendError> {
        let due: Vec<String> = ::redis::cmd("ZRANGEBYSCORE")
            .arg(self.key("delayed"))
            .arg("-inf")
            .arg(now.timestamp_millis())
            .query(conn)
            .map_err(|e| command("ZRANGEBYSCORE", e))?;

        for id in due {
            // Only the caller that removes the entry requeues it.
            let removed: i64 = ::redis::cmd("ZREM")
                .arg(self.key("delayed"))
                .arg(&id)
                .query(conn)
                .map_err(|e| command("ZREM", e))?;
            if removed == 1 {
                ::redis::cmd("LPUSH")
                    .arg(self.key("wait"))
                    .arg(&id)
                    .query::<()>(conn)
                    .map_err(|e| command("LPUSH", e))?;
            }
        }
        Ok(())
    }

    /// Drop the oldest failed jobs beyond the retention limit.
    fn trim_failed(&self, conn: &mut ::redis::Connection) -> Result<(), BackendError> {
        let keep = self.failed_retention as i64;
        let evicted: Vec<String> = ::redis::cmd("ZRANGE")
            .arg(self.key("failed"))
            .arg(0)
            .arg(-(keep + 1))
            .query(conn)
            .map_err(|e| command("ZRANGE", e))?;
        if evicted.is_empty() {
            return Ok(());
        }

        let mut pipe = ::redis::pipe();
        pipe.atomic();
        for id in &evicted {
            pipe.cmd("ZREM").arg(self.key("failed")).arg(id).ignore();
            pipe.cmd("DEL").arg(self.job_key(id)).ignore();
        }
        pipe.query::<()>(conn).map_err(|e| command("failed-set trim", e))
    }
}

fn command(what: &str, err: ::redis::RedisError) -> BackendError {
    BackendError::Command(format!("{what} failed: {err}"))
}

fn encode(job: &Job) -> Result<String, BackendError> {
    serde_json::to_string(job).map_err(|e| BackendError::Serialization(e.to_string()))
}

fn decode(raw: &str) -> Result<Job, BackendError> {
    serde_json::from_str(raw).map_err(|e| BackendError::Serialization(e.to_string()))
}

#[async_trait]
impl ExecutionBackend for RedisBackend {
    async fn submit(&self, request: JobRequest) -> Result<JobId, BackendError> {
        self.blocking(move |conn, this| {
            let id = JobId::primary();
            let record = encode(&Job::from_request(id.clone(), request))?;

            ::redis::pipe()
                .atomic()
                .cmd("SET")
                .arg(this.job_key(id.as_str()))
                .arg(&record)
                .ignore()
                .cmd("LPUSH")
                .arg(this.key("wait"))
                .arg(id.as_str())
                .ignore()
                .query::<()>(conn)
                .map_err(|e| command("enqueue", e))?;

            Ok(id)
        })
        .await
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>, BackendError> {
        let id = id.clone();
        self.blocking(move |conn, this| {
            let record: Option<String> = ::redis::cmd("GET")
                .arg(this.job_key(id.as_str()))
                .query(conn)
                .map_err(|e| command("GET", e))?;

            record.as_deref().map(decode).transpose()
        })
        .await
    }

    async fn counts(&self) -> Result<QueueCounts, BackendError> {
        self.blocking(|conn, this| {
            let (waiting, active, delayed, completed, failed): (u64, u64, u64, Option<u64>, u64) =
                ::redis::pipe()
                    .cmd("LLEN")
                    .arg(this.key("wait"))
                    .cmd("LLEN")
                    .arg(this.key("active"))
                    .cmd("ZCARD")
                    .arg(this.key("delayed"))
                    .cmd("GET")
                    .arg(this.key("completed"))
                    .cmd("ZCARD")
                    .arg(this.key("failed"))
                    .query(conn)
                    .map_err(|e| command("count query", e))?;

            Ok(QueueCounts {
                waiting,
                active,
                completed: completed.unwrap_or(0),
                failed,
                delayed,
                error: false,
            })
        })
        .await
    }
}

#[async_trait]
impl WorkSource for RedisBackend {
    async fn claim(&self) -> Result<Option<Job>, BackendError> {
        self.blocking(|conn, this| {
            this.promote_due(conn, Utc::now())?;

            let Some(id) = ::redis::cmd("RPOPLPUSH")
                .arg(this.key("wait"))
                .arg(this.key("active"))
                .query::<Option<String>>(conn)
                .map_err(|e| command("RPOPLPUSH", e))?
            else {
                return Ok(None);
            };

            let record: Option<String> = ::redis::cmd("GET")
                .arg(this.job_key(&id))
                .query(conn)
                .map_err(|e| command("GET", e))?;
            let Some(record) = record else {
                ::redis::cmd("LREM")
                    .arg(this.key("active"))
                    .arg(0)
                    .arg(&id)
                    .query::<()>(conn)
                    .map_err(|e| command("LREM", e))?;
                return Ok(None);
            };

            let mut job = decode(&record)?;
            job.mark_active();
            ::redis::cmd("SET")
                .arg(this.job_key(&id))
                .arg(encode(&job)?)
                .query::<()>(conn)
                .map_err(|e| command("SET", e))?;
            Ok(Some(job))
        })
        .await
    }

    async fn finish(&self, job: &Job) -> Result<(), BackendError> {
        let job = job.clone();
        self.blocking(move |conn, this| {
            let id = job.id.as_str();
            let mut pipe = ::redis::pipe();
            pipe.atomic()
                .cmd("LREM")
                .arg(this.key("active"))
                .arg(0)
                .arg(id)
                .ignore();

            match &job.status {
                JobStatus::Completed => {
                    pipe.cmd("DEL").arg(this.job_key(id)).ignore();
                    pipe.cmd("INCR").arg(this.key("completed")).ignore();
                }
                JobStatus::Failed { .. } => {
                    pipe.cmd("SET").arg(this.job_key(id)).arg(encode(&job)?).ignore();
                    pipe.cmd("ZADD")
                        .arg(this.key("failed"))
                        .arg(job.updated_at.timestamp_millis())
                        .arg(id)
                        .ignore();
                }
                JobStatus::Delayed { .. } => {
                    let at = job.scheduled_at.unwrap_or_else(Utc::now);
                    pipe.cmd("SET").arg(this.job_key(id)).arg(encode(&job)?).ignore();
                    pipe.cmd("ZADD")
                        .arg(this.key("delayed"))
                        .arg(at.timestamp_millis())
                        .arg(id)
                        .ignore();
                }
                JobStatus::Waiting => {
                    pipe.cmd("SET").arg(this.job_key(id)).arg(encode(&job)?).ignore();
                    pipe.cmd("LPUSH").arg(this.key("wait")).arg(id).ignore();
                }
                JobStatus::Active => {
                    pipe.cmd("SET").arg(this.job_key(id)).arg(encode(&job)?).ignore();
                }
            }
            pipe.query::<()>(conn).map_err(|e| command("finish", e))?;

            if matches!(job.status, JobStatus::Failed { .. }) {
                this.trim_failed(conn)?;
            }
            Ok(())
        })
        .await
    }

    async fn wait_for_work(&self, idle: Duration) {
        tokio::time::sleep(idle).await;
    }
}
