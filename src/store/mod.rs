//! Durable store and fast cache for workflow state.
//!
//! The store is authoritative; the cache is an advisory TTL copy that is
//! safe to lose. `FileStateStore` keeps one JSON document per task with
//! atomic temp-file-plus-rename writes and an exclusive file lock around
//! the write, so a crashed writer never leaves a torn record.

use async_trait::async_trait;
use fs2::FileExt;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::workflow::errors::WorkflowError;
use crate::workflow::state::WorkflowState;

/// Durable key-value persistence for workflow state, keyed by task id.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, task_id: &str) -> Result<Option<WorkflowState>, WorkflowError>;
    async fn upsert(&self, state: &WorkflowState) -> Result<(), WorkflowError>;
}

/// Low-latency advisory cache with TTL. Losing entries is safe; readers
/// fall back to the durable store.
#[async_trait]
pub trait StateCache: Send + Sync {
    async fn get(&self, task_id: &str) -> Result<Option<WorkflowState>, WorkflowError>;
    async fn set(&self, state: &WorkflowState, ttl: Duration) -> Result<(), WorkflowError>;
    /// Drops every cached entry.
    async fn clear(&self) -> Result<(), WorkflowError>;
}

fn storage_err(err: impl std::fmt::Display) -> WorkflowError {
    WorkflowError::Storage {
        message: err.to_string(),
    }
}

/// File-backed durable store: `<dir>/<task>.json` per task.
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn task_path(&self, task_id: &str) -> PathBuf {
        // Task ids are caller-supplied; keep only filename-safe characters.
        let safe: String = task_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}.json", safe))
    }

    fn lock_file(&self) -> Result<File, WorkflowError> {
        std::fs::create_dir_all(&self.dir).map_err(storage_err)?;
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.dir.join(".lock"))
            .map_err(storage_err)?;
        lock.lock_exclusive().map_err(storage_err)?;
        Ok(lock)
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self, task_id: &str) -> Result<Option<WorkflowState>, WorkflowError> {
        let path = self.task_path(task_id);
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(storage_err(e)),
        };
        let state = serde_json::from_str(&content).map_err(storage_err)?;
        Ok(Some(state))
    }

    async fn upsert(&self, state: &WorkflowState) -> Result<(), WorkflowError> {
        let lock = self.lock_file()?;
        let path = self.task_path(&state.task_id);
        let content = serde_json::to_string_pretty(state).map_err(storage_err)?;

        let temp_path = path.with_extension("json.tmp");
        std::fs::write(&temp_path, &content).map_err(storage_err)?;
        std::fs::rename(&temp_path, &path).map_err(storage_err)?;

        let _ = fs2::FileExt::unlock(&lock);
        Ok(())
    }
}

/// In-memory store for tests and single-process wiring.
#[derive(Default)]
pub struct MemoryStateStore {
    inner: RwLock<HashMap<String, WorkflowState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, task_id: &str) -> Result<Option<WorkflowState>, WorkflowError> {
        Ok(self.inner.read().await.get(task_id).cloned())
    }

    async fn upsert(&self, state: &WorkflowState) -> Result<(), WorkflowError> {
        self.inner
            .write()
            .await
            .insert(state.task_id.clone(), state.clone());
        Ok(())
    }
}

/// In-memory TTL cache.
#[derive(Default)]
pub struct MemoryStateCache {
    inner: RwLock<HashMap<String, (WorkflowState, Instant)>>,
}

impl MemoryStateCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateCache for MemoryStateCache {
    async fn get(&self, task_id: &str) -> Result<Option<WorkflowState>, WorkflowError> {
        {
            let inner = self.inner.read().await;
            match inner.get(task_id) {
                Some((state, deadline)) if *deadline > Instant::now() => {
                    return Ok(Some(state.clone()))
                }
                Some(_) => {}
                None => return Ok(None),
            }
        }
        // Entry expired; evict under the write lock.
        self.inner.write().await.remove(task_id);
        Ok(None)
    }

    async fn set(&self, state: &WorkflowState, ttl: Duration) -> Result<(), WorkflowError> {
        let deadline = Instant::now() + ttl;
        self.inner
            .write()
            .await
            .insert(state.task_id.clone(), (state.clone(), deadline));
        Ok(())
    }

    async fn clear(&self) -> Result<(), WorkflowError> {
        self.inner.write().await.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests;
