//! Tests for the durable store and the TTL cache.

use super::*;
use crate::workflow::state::{WorkflowPhase, WorkflowState};
use chrono::Utc;
use tempfile::TempDir;

fn sample_state(task_id: &str) -> WorkflowState {
    let mut state = WorkflowState::new(task_id);
    state
        .apply_transition(WorkflowPhase::Planning, "START_PLANNING", None, Utc::now())
        .expect("IDLE -> PLANNING is valid");
    state
}

#[tokio::test]
async fn test_file_store_roundtrip() {
    let temp = TempDir::new().expect("temp dir");
    let store = FileStateStore::new(temp.path().join("state"));

    let state = sample_state("task-1");
    store.upsert(&state).await.expect("upsert");

    let loaded = store
        .load("task-1")
        .await
        .expect("load")
        .expect("state present");
    assert_eq!(loaded, state);
    assert_eq!(loaded.history.len(), 1);
}

#[tokio::test]
async fn test_file_store_upsert_replaces_existing_record() {
    let temp = TempDir::new().expect("temp dir");
    let store = FileStateStore::new(temp.path().join("state"));

    let mut state = sample_state("task-1");
    store.upsert(&state).await.expect("first upsert");

    state
        .apply_transition(WorkflowPhase::Executing, "START_EXECUTION", None, Utc::now())
        .expect("PLANNING -> EXECUTING is valid");
    state.retry_count = 2;
    store.upsert(&state).await.expect("second upsert");

    let loaded = store
        .load("task-1")
        .await
        .expect("load")
        .expect("state present");
    assert_eq!(loaded.current_state, WorkflowPhase::Executing);
    assert_eq!(loaded.retry_count, 2);
    assert_eq!(loaded.history.len(), 2);
}

#[tokio::test]
async fn test_file_store_missing_task_is_none() {
    let temp = TempDir::new().expect("temp dir");
    let store = FileStateStore::new(temp.path().join("state"));

    assert!(store.load("missing").await.expect("load").is_none());
}

#[tokio::test]
async fn test_file_store_sanitizes_task_ids() {
    let temp = TempDir::new().expect("temp dir");
    let dir = temp.path().join("state");
    let store = FileStateStore::new(dir.clone());

    // A task id with path separators must not escape the state directory
    let state = sample_state("../evil/task");
    store.upsert(&state).await.expect("upsert");

    let loaded = store
        .load("../evil/task")
        .await
        .expect("load")
        .expect("state present");
    assert_eq!(loaded.task_id, "../evil/task");
    assert!(!temp.path().join("evil").exists());
    assert!(dir.join("___evil_task.json").exists());
}

#[tokio::test]
async fn test_file_store_leaves_no_temp_files() {
    let temp = TempDir::new().expect("temp dir");
    let dir = temp.path().join("state");
    let store = FileStateStore::new(dir.clone());

    store.upsert(&sample_state("task-1")).await.expect("upsert");

    let leftovers: Vec<_> = std::fs::read_dir(&dir)
        .expect("read dir")
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "tmp"))
        .collect();
    assert!(leftovers.is_empty());
}

#[tokio::test]
async fn test_memory_store_roundtrip() {
    let store = MemoryStateStore::new();
    let state = sample_state("task-1");

    store.upsert(&state).await.expect("upsert");
    let loaded = store
        .load("task-1")
        .await
        .expect("load")
        .expect("state present");
    assert_eq!(loaded, state);
    assert!(store.load("other").await.expect("load").is_none());
}

#[tokio::test]
async fn test_cache_returns_entry_within_ttl() {
    let cache = MemoryStateCache::new();
    let state = sample_state("task-1");

    cache
        .set(&state, Duration::from_secs(60))
        .await
        .expect("set");
    let cached = cache
        .get("task-1")
        .await
        .expect("get")
        .expect("entry present");
    assert_eq!(cached, state);
}

#[tokio::test]
async fn test_cache_expires_entries_after_ttl() {
    let cache = MemoryStateCache::new();
    let state = sample_state("task-1");

    cache
        .set(&state, Duration::from_millis(10))
        .await
        .expect("set");
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert!(cache.get("task-1").await.expect("get").is_none());
}

#[tokio::test]
async fn test_cache_clear_drops_everything() {
    let cache = MemoryStateCache::new();
    cache
        .set(&sample_state("task-1"), Duration::from_secs(60))
        .await
        .expect("set");
    cache
        .set(&sample_state("task-2"), Duration::from_secs(60))
        .await
        .expect("set");

    cache.clear().await.expect("clear");

    assert!(cache.get("task-1").await.expect("get").is_none());
    assert!(cache.get("task-2").await.expect("get").is_none());
}
