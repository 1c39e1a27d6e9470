//! The ONLY place where workflow state transitions happen.
//!
//! The state machine validates every transition against the table, persists
//! the result to the durable store before refreshing the cache, and publishes
//! the accepted transition to the event bus only after persistence has
//! completed, so subscribers never observe a transition that could be lost
//! on crash. Transitions for one task are serialized through a per-task lock.

use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::bus::{EventBus, WORKFLOW_EVENTS_TOPIC};
use crate::collaborators::{TaskStatus, TaskStatusSink};
use crate::store::{StateCache, StateStore};
use crate::workflow::errors::WorkflowError;
use crate::workflow::state::{TransitionRecord, WorkflowPhase, WorkflowState};

pub struct WorkflowStateMachine {
    store: Arc<dyn StateStore>,
    cache: Arc<dyn StateCache>,
    bus: Arc<dyn EventBus>,
    task_status: Arc<dyn TaskStatusSink>,
    cache_ttl: Duration,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl WorkflowStateMachine {
    pub fn new(
        store: Arc<dyn StateStore>,
        cache: Arc<dyn StateCache>,
        bus: Arc<dyn EventBus>,
        task_status: Arc<dyn TaskStatusSink>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            bus,
            task_status,
            cache_ttl,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Per-task lock serializing concurrent transition attempts.
    async fn lock_for(&self, task_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(task_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Creates state at IDLE and persists it to both store and cache.
    /// Rejects re-initialization of an existing task rather than silently
    /// overwriting its history.
    pub async fn initialize_workflow(&self, task_id: &str) -> Result<WorkflowState, WorkflowError> {
        let lock = self.lock_for(task_id).await;
        let _guard = lock.lock().await;

        if self.store.load(task_id).await?.is_some() {
            return Err(WorkflowError::AlreadyExists {
                task_id: task_id.to_string(),
            });
        }

        let state = WorkflowState::new(task_id);
        self.persist(&state).await?;
        Ok(state)
    }

    /// Validates and applies one transition, then publishes it.
    pub async fn transition(
        &self,
        task_id: &str,
        to: WorkflowPhase,
        event: &str,
        metadata: Option<HashMap<String, Value>>,
    ) -> Result<WorkflowState, WorkflowError> {
        let lock = self.lock_for(task_id).await;
        let _guard = lock.lock().await;
        self.transition_locked(task_id, to, event, metadata, |_| {})
            .await
    }

    /// Cache-first read; a miss falls through to the durable store and
    /// repopulates the cache.
    pub async fn get_state(&self, task_id: &str) -> Result<WorkflowState, WorkflowError> {
        match self.cache.get(task_id).await {
            Ok(Some(state)) => return Ok(state),
            Ok(None) => {}
            Err(e) => tracing::warn!(task_id = %task_id, "state cache read failed: {}", e),
        }

        let state = self.read_from_store(task_id).await?;
        if let Err(e) = self.cache.set(&state, self.cache_ttl).await {
            tracing::warn!(task_id = %task_id, "state cache refresh failed: {}", e);
        }
        Ok(state)
    }

    /// Records the failure reason, transitions to FAILED (event `ERROR`),
    /// and signals the external task record.
    pub async fn mark_failed(&self, task_id: &str, error: &str) -> Result<(), WorkflowError> {
        {
            let lock = self.lock_for(task_id).await;
            let _guard = lock.lock().await;
            let metadata = HashMap::from([("error".to_string(), json!(error))]);
            let error = error.to_string();
            self.transition_locked(task_id, WorkflowPhase::Failed, "ERROR", Some(metadata), |s| {
                s.last_error = Some(error);
            })
            .await?;
        }

        self.task_status
            .update_task_status(task_id, TaskStatus::Failed, None)
            .await
            .map_err(|e| WorkflowError::CollaboratorUnavailable {
                name: "task-status".to_string(),
                message: format!("{:#}", e),
            })
    }

    /// Transitions to COMPLETED (event `COMPLETE`) and signals the external
    /// task record with the completion timestamp.
    pub async fn mark_completed(
        &self,
        task_id: &str,
        result: Option<&str>,
    ) -> Result<(), WorkflowError> {
        {
            let lock = self.lock_for(task_id).await;
            let _guard = lock.lock().await;
            let metadata =
                result.map(|r| HashMap::from([("result".to_string(), json!(r))]));
            self.transition_locked(task_id, WorkflowPhase::Completed, "COMPLETE", metadata, |_| {})
                .await?;
        }

        self.task_status
            .update_task_status(task_id, TaskStatus::Success, Some(Utc::now()))
            .await
            .map_err(|e| WorkflowError::CollaboratorUnavailable {
                name: "task-status".to_string(),
                message: format!("{:#}", e),
            })
    }

    /// Bookkeeping write (no transition, no event): bumps the retry counter
    /// and returns the new count.
    pub async fn increment_retry(&self, task_id: &str) -> Result<u32, WorkflowError> {
        let lock = self.lock_for(task_id).await;
        let _guard = lock.lock().await;

        let mut state = self.read_from_store(task_id).await?;
        state.retry_count += 1;
        self.persist(&state).await?;
        Ok(state.retry_count)
    }

    /// Bookkeeping write: records which subtask is currently executing.
    pub async fn set_current_subtask(
        &self,
        task_id: &str,
        subtask_id: Option<&str>,
    ) -> Result<(), WorkflowError> {
        let lock = self.lock_for(task_id).await;
        let _guard = lock.lock().await;

        let mut state = self.read_from_store(task_id).await?;
        state.current_subtask_id = subtask_id.map(str::to_string);
        self.persist(&state).await
    }

    /// Explicit external retry: only valid on a FAILED task. Resets the
    /// retry counter and returns the task to IDLE so `execute_task` can run
    /// again from the top. The IDLE reset deliberately bypasses the
    /// transition table (FAILED has no IDLE edge); the out-of-band record
    /// keeps the history auditable.
    pub async fn reset_for_retry(&self, task_id: &str) -> Result<WorkflowState, WorkflowError> {
        let lock = self.lock_for(task_id).await;
        let _guard = lock.lock().await;

        let mut state = self.read_from_store(task_id).await?;
        if state.current_state != WorkflowPhase::Failed {
            return Err(WorkflowError::InvalidTransition {
                from: state.current_state,
                to: WorkflowPhase::Idle,
            });
        }

        let record = TransitionRecord {
            from: state.current_state,
            to: WorkflowPhase::Idle,
            event: "EXTERNAL_RETRY".to_string(),
            metadata: None,
            timestamp: Utc::now(),
        };
        state.history.push(record.clone());
        state.current_state = WorkflowPhase::Idle;
        state.progress = 0;
        state.retry_count = 0;
        state.current_subtask_id = None;
        // last_error is retained for diagnostics until a newer failure.

        self.persist(&state).await?;
        self.publish_transition(task_id, &record).await?;
        Ok(state)
    }

    async fn transition_locked<F>(
        &self,
        task_id: &str,
        to: WorkflowPhase,
        event: &str,
        metadata: Option<HashMap<String, Value>>,
        before: F,
    ) -> Result<WorkflowState, WorkflowError>
    where
        F: FnOnce(&mut WorkflowState),
    {
        let mut state = self.read_state_for_update(task_id).await?;
        before(&mut state);
        let record = state
            .apply_transition(to, event, metadata, Utc::now())?
            .clone();

        // Durable persistence must complete before the event goes out.
        self.persist(&state).await?;
        self.publish_transition(task_id, &record).await?;
        Ok(state)
    }

    /// Reads for mutation: cache-first like `get_state`, but without the
    /// cache repopulation (the write that follows refreshes it anyway).
    async fn read_state_for_update(&self, task_id: &str) -> Result<WorkflowState, WorkflowError> {
        match self.cache.get(task_id).await {
            Ok(Some(state)) => return Ok(state),
            Ok(None) => {}
            Err(e) => tracing::warn!(task_id = %task_id, "state cache read failed: {}", e),
        }
        self.read_from_store(task_id).await
    }

    async fn read_from_store(&self, task_id: &str) -> Result<WorkflowState, WorkflowError> {
        self.store
            .load(task_id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound {
                what: format!("workflow state for task {}", task_id),
            })
    }

    /// Store first (authoritative), then best-effort cache refresh.
    async fn persist(&self, state: &WorkflowState) -> Result<(), WorkflowError> {
        self.store.upsert(state).await?;
        if let Err(e) = self.cache.set(state, self.cache_ttl).await {
            tracing::warn!(task_id = %state.task_id, "state cache write failed: {}", e);
        }
        Ok(())
    }

    async fn publish_transition(
        &self,
        task_id: &str,
        record: &TransitionRecord,
    ) -> Result<(), WorkflowError> {
        let payload = json!({
            "type": "STATE_TRANSITION",
            "taskId": task_id,
            "transition": record,
            "timestamp": Utc::now().to_rfc3339(),
        });
        self.bus.publish(WORKFLOW_EVENTS_TOPIC, payload).await
    }
}
