//! Error taxonomy for the workflow core.

use std::fmt::{Display, Formatter};

use crate::workflow::state::WorkflowPhase;

/// Errors surfaced by the state machine, orchestrator, and stores.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowError {
    /// Attempted state change violates the transition table.
    InvalidTransition {
        from: WorkflowPhase,
        to: WorkflowPhase,
    },
    /// Referenced task, plan, or workflow state does not exist.
    NotFound { what: String },
    /// Re-initialization of an existing workflow.
    AlreadyExists { task_id: String },
    /// A subtask's file edits, commands, or verification failed.
    SubtaskFailure {
        subtask_id: String,
        message: String,
    },
    /// Nonzero failed-test count from the test runner.
    TestFailure { failed: u32 },
    /// A required external service is unreachable.
    CollaboratorUnavailable { name: String, message: String },
    /// Retry count reached the configured maximum.
    RetryExhausted { retries: u32 },
    /// Durable store read/write failure.
    Storage { message: String },
}

impl Display for WorkflowError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidTransition { from, to } => {
                write!(f, "invalid transition from {} to {}", from, to)
            }
            Self::NotFound { what } => write!(f, "not found: {}", what),
            Self::AlreadyExists { task_id } => {
                write!(f, "workflow already exists for task {}", task_id)
            }
            Self::SubtaskFailure {
                subtask_id,
                message,
            } => write!(f, "subtask {} failed: {}", subtask_id, message),
            Self::TestFailure { failed } => {
                write!(f, "tests failed with {} failures", failed)
            }
            Self::CollaboratorUnavailable { name, message } => {
                write!(f, "collaborator {} unavailable: {}", name, message)
            }
            Self::RetryExhausted { retries } => {
                write!(f, "retries exhausted after {} attempts", retries)
            }
            Self::Storage { message } => write!(f, "storage failure: {}", message),
        }
    }
}

impl std::error::Error for WorkflowError {}
