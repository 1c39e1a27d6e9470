//! Workflow orchestration core: state machine, task orchestrator, and the
//! service entry point that launches tasks.
//!
//! `WorkflowService::start_workflow` detaches execution onto the runtime so
//! the initiating call returns immediately; failures inside the detached
//! task are contained by the orchestrator's own failure handler and never
//! crash the runtime.

pub mod errors;
pub mod orchestrator;
pub mod state;
pub mod state_machine;

pub use errors::WorkflowError;
pub use orchestrator::{Collaborators, TaskOrchestrator, TaskProgress};
pub use state::{TransitionRecord, WorkflowPhase, WorkflowState};
pub use state_machine::WorkflowStateMachine;

use anyhow::Result;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Receipt returned as soon as a workflow launch is enqueued.
#[derive(Debug, Clone, Serialize)]
pub struct StartReceipt {
    pub task_id: String,
    pub status: String,
    pub message: String,
}

/// Entry point for callers: fire-and-forget launch, status reads, and
/// explicit retries.
pub struct WorkflowService {
    orchestrator: Arc<TaskOrchestrator>,
}

impl WorkflowService {
    pub fn new(orchestrator: Arc<TaskOrchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Enqueues `execute_task` on the runtime and returns immediately. The
    /// join handle is for callers that want to await completion (the CLI
    /// does); dropping it detaches the run.
    pub fn start_workflow(&self, task_id: &str, repo_root: &Path) -> (StartReceipt, JoinHandle<()>) {
        let orchestrator = Arc::clone(&self.orchestrator);
        let task_id_owned = task_id.to_string();
        let repo_root: PathBuf = repo_root.to_path_buf();

        let handle = tokio::spawn(async move {
            orchestrator.execute_task(&task_id_owned, &repo_root).await;
        });

        (
            StartReceipt {
                task_id: task_id.to_string(),
                status: "started".to_string(),
                message: "Workflow execution started".to_string(),
            },
            handle,
        )
    }

    pub async fn workflow_status(&self, task_id: &str) -> Result<TaskProgress, WorkflowError> {
        self.orchestrator.get_task_progress(task_id).await
    }

    /// Explicit external retry: only FAILED tasks qualify. Resets the retry
    /// counter to zero and relaunches execution from the top.
    pub async fn retry_workflow(
        &self,
        task_id: &str,
        repo_root: &Path,
    ) -> Result<(StartReceipt, JoinHandle<()>)> {
        let state = self.orchestrator.state_machine().get_state(task_id).await?;
        if state.current_state != WorkflowPhase::Failed {
            anyhow::bail!(
                "only failed tasks can be retried (task {} is {})",
                task_id,
                state.current_state
            );
        }

        self.orchestrator
            .state_machine()
            .reset_for_retry(task_id)
            .await?;
        Ok(self.start_workflow(task_id, repo_root))
    }
}
