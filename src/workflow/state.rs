//! Workflow state model: phases, the transition table, and the per-task
//! state record that gets persisted and published.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::{Display, Formatter};

use crate::workflow::errors::WorkflowError;

/// The phase a task's workflow is currently in.
///
/// Serialized in SCREAMING_SNAKE_CASE to match the persisted record and
/// event wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowPhase {
    Idle,
    Planning,
    Executing,
    Testing,
    Debugging,
    Retrying,
    Delivering,
    Completed,
    Failed,
}

impl WorkflowPhase {
    /// Returns true when the transition table allows `self -> to`.
    ///
    /// `Completed` is terminal; `Failed` is semi-terminal (only edge is to
    /// `Retrying`, taken on an explicit external retry).
    pub fn can_transition_to(self, to: WorkflowPhase) -> bool {
        use WorkflowPhase::*;
        matches!(
            (self, to),
            (Idle, Planning)
                | (Planning, Executing)
                | (Planning, Failed)
                | (Executing, Testing)
                | (Executing, Delivering)
                | (Executing, Debugging)
                | (Executing, Failed)
                | (Testing, Debugging)
                | (Testing, Delivering)
                | (Testing, Failed)
                | (Debugging, Executing)
                | (Debugging, Retrying)
                | (Debugging, Failed)
                | (Retrying, Executing)
                | (Retrying, Failed)
                | (Delivering, Completed)
                | (Delivering, Failed)
                | (Failed, Retrying)
        )
    }

    /// Progress guidance value for a phase. `None` for `Failed`, which keeps
    /// whatever progress the task had when it failed.
    pub fn progress(self) -> Option<u8> {
        match self {
            WorkflowPhase::Idle => Some(0),
            WorkflowPhase::Planning => Some(10),
            WorkflowPhase::Executing => Some(40),
            WorkflowPhase::Retrying => Some(45),
            WorkflowPhase::Debugging => Some(50),
            WorkflowPhase::Testing => Some(60),
            WorkflowPhase::Delivering => Some(85),
            WorkflowPhase::Completed => Some(100),
            WorkflowPhase::Failed => None,
        }
    }
}

impl Display for WorkflowPhase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WorkflowPhase::Idle => "IDLE",
            WorkflowPhase::Planning => "PLANNING",
            WorkflowPhase::Executing => "EXECUTING",
            WorkflowPhase::Testing => "TESTING",
            WorkflowPhase::Debugging => "DEBUGGING",
            WorkflowPhase::Retrying => "RETRYING",
            WorkflowPhase::Delivering => "DELIVERING",
            WorkflowPhase::Completed => "COMPLETED",
            WorkflowPhase::Failed => "FAILED",
        };
        write!(f, "{}", name)
    }
}

/// One accepted transition, appended to the task's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: WorkflowPhase,
    pub to: WorkflowPhase,
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, Value>>,
    pub timestamp: DateTime<Utc>,
}

/// The full workflow state for one task. Owned exclusively by the state
/// machine; everything else sees serialized copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub task_id: String,
    pub current_state: WorkflowPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_subtask_id: Option<String>,
    pub progress: u8,
    pub history: Vec<TransitionRecord>,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl WorkflowState {
    /// Fresh state at IDLE with an empty history.
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            current_state: WorkflowPhase::Idle,
            current_subtask_id: None,
            progress: 0,
            history: Vec::new(),
            retry_count: 0,
            last_error: None,
            metadata: HashMap::new(),
        }
    }

    /// The single mutation path for state changes. Validates against the
    /// transition table; on rejection nothing is mutated. On acceptance:
    /// appends the history record, merges metadata into the open bag, and
    /// recomputes progress (FAILED retains the prior value).
    pub fn apply_transition(
        &mut self,
        to: WorkflowPhase,
        event: &str,
        metadata: Option<HashMap<String, Value>>,
        now: DateTime<Utc>,
    ) -> Result<&TransitionRecord, WorkflowError> {
        if !self.current_state.can_transition_to(to) {
            return Err(WorkflowError::InvalidTransition {
                from: self.current_state,
                to,
            });
        }

        let record = TransitionRecord {
            from: self.current_state,
            to,
            event: event.to_string(),
            metadata: metadata.clone(),
            timestamp: now,
        };
        self.history.push(record);
        self.current_state = to;

        if let Some(extra) = metadata {
            self.metadata.extend(extra);
        }

        if let Some(progress) = to.progress() {
            self.progress = progress;
        }

        // push above guarantees the vec is non-empty
        Ok(self
            .history
            .last()
            .unwrap_or_else(|| unreachable!("history entry was just appended")))
    }
}
