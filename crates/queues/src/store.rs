//! Durable storage for the fallback queue.
//!
//! The contract is small: `load` returns everything that was last saved (or
//! nothing on first run), `save_all` replaces the whole list. Writers are
//! serialized by the owning [`FallbackQueue`](crate::fallback::FallbackQueue);
//! stores only need to be safe for a single writer process.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use crate::error::StoreError;
use crate::types::FallbackJob;

/// Fallback store abstraction.
#[async_trait]
pub trait FallbackStore: Send + Sync + 'static {
    /// Read the persisted list. Empty when nothing was persisted yet.
    async fn load(&self) -> Result<Vec<FallbackJob>, StoreError>;

    /// Replace the persisted list with exactly `jobs`.
    ///
    /// A concurrent `load` must observe either the old or the new list.
    async fn save_all(&self, jobs: &[FallbackJob]) -> Result<(), StoreError>;
}

#[async_trait]
impl<S: FallbackStore + ?Sized> FallbackStore for Arc<S> {
    async fn load(&self) -> Result<Vec<FallbackJob>, StoreError> {
        (**self).load().await
    }

    async fn save_all(&self, jobs: &[FallbackJob]) -> Result<(), StoreError> {
        (**self).save_all(jobs).await
    }
}

/// JSON file store.
///
/// Saves go to `<file>.tmp`, are fsynced, then renamed over the target, so a
/// crash mid-write leaves the previous list intact.
#[derive(Debug, Clone)]
pub struct FileFallbackStore {
    path: PathBuf,
}

impl FileFallbackStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "fallback-queue.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl FallbackStore for FileFallbackStore {
    async fn load(&self) -> Result<Vec<FallbackJob>, StoreError> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::Io(e)),
        };

        if data.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }

        serde_json::from_slice(&data).map_err(|e| {
            StoreError::Corrupt(format!("{}: {e}", self.path.display()))
        })
    }

    async fn save_all(&self, jobs: &[FallbackJob]) -> Result<(), StoreError> {
        let data = serde_json::to_vec_pretty(jobs)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let path = self.path.clone();
        let tmp = self.tmp_path();

        tokio::task::spawn_blocking(move || write_atomically(&path, &tmp, &data))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

fn write_atomically(path: &Path, tmp: &Path, data: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(tmp)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);

    std::fs::rename(tmp, path)?;
    Ok(())
}

/// In-memory store for tests/dev. Does not survive a restart.
#[derive(Debug, Default)]
pub struct InMemoryFallbackStore {
    jobs: Mutex<Vec<FallbackJob>>,
}

impl InMemoryFallbackStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_jobs(jobs: Vec<FallbackJob>) -> Self {
        Self {
            jobs: Mutex::new(jobs),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Synchronous peek for assertions.
    pub fn snapshot(&self) -> Vec<FallbackJob> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl FallbackStore for InMemoryFallbackStore {
    async fn load(&self) -> Result<Vec<FallbackJob>, StoreError> {
        Ok(self.snapshot())
    }

    async fn save_all(&self, jobs: &[FallbackJob]) -> Result<(), StoreError> {
        *self.jobs.lock().unwrap_or_else(PoisonError::into_inner) = jobs.to_vec();
        Ok(())
    }
}
