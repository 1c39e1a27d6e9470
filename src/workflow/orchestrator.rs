//! Drives one task end to end: context gather, planning, subtask execution,
//! quality check, tests, completion. Collaborator failures are converted
//! into bounded retries or terminal failure.
//!
//! Progress messages go out through two channels at once: a durable bus
//! publish and a direct gateway dispatch. Either failing is logged, never
//! fatal to the phase.

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use crate::bus::{EventBus, TASK_PROGRESS_TOPIC};
use crate::collaborators::{
    CommandExecutor, ContextGatherer, FileEditor, Planner, QualityAnalyzer, Subtask, SubtaskSink,
    SubtaskStatus, TestRunner,
};
use crate::gateway::EventFanOutGateway;
use crate::workflow::errors::WorkflowError;
use crate::workflow::state::{TransitionRecord, WorkflowPhase};
use crate::workflow::state_machine::WorkflowStateMachine;

/// Issues forwarded in a single quality-review event.
const MAX_REVIEW_ISSUES: usize = 20;

/// External collaborators the orchestrator drives, gathered so wiring stays
/// in one place.
pub struct Collaborators {
    pub planner: Arc<dyn Planner>,
    pub subtasks: Arc<dyn SubtaskSink>,
    pub editor: Arc<dyn FileEditor>,
    pub commands: Arc<dyn CommandExecutor>,
    pub tests: Arc<dyn TestRunner>,
    pub quality: Arc<dyn QualityAnalyzer>,
    pub context: Arc<dyn ContextGatherer>,
}

pub struct TaskOrchestrator {
    state_machine: Arc<WorkflowStateMachine>,
    collaborators: Collaborators,
    bus: Arc<dyn EventBus>,
    gateway: Arc<EventFanOutGateway>,
    max_retries: u32,
    quality_format_threshold: u32,
}

/// Read-only aggregate of a task's progress.
#[derive(Debug, Clone, Serialize)]
pub struct TaskProgress {
    pub task_id: String,
    pub current_state: WorkflowPhase,
    pub progress: u8,
    pub completed_subtasks: usize,
    pub total_subtasks: usize,
    pub retry_count: u32,
    pub history: Vec<TransitionRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl TaskOrchestrator {
    pub fn new(
        state_machine: Arc<WorkflowStateMachine>,
        collaborators: Collaborators,
        bus: Arc<dyn EventBus>,
        gateway: Arc<EventFanOutGateway>,
        max_retries: u32,
        quality_format_threshold: u32,
    ) -> Self {
        Self {
            state_machine,
            collaborators,
            bus,
            gateway,
            max_retries,
            quality_format_threshold,
        }
    }

    pub fn state_machine(&self) -> &Arc<WorkflowStateMachine> {
        &self.state_machine
    }

    /// Runs the full phase sequence for one task. Every failure, from any
    /// phase, routes into the retry/terminal-failure handler; this function
    /// itself never propagates an error.
    pub async fn execute_task(&self, task_id: &str, repo_root: &Path) {
        if let Err(error) = self.run_phases(task_id, repo_root).await {
            self.handle_task_failure(task_id, &error).await;
        }
    }

    async fn run_phases(&self, task_id: &str, repo_root: &Path) -> Result<()> {
        let started = Instant::now();

        self.ensure_initialized(task_id).await?;
        self.emit_status(task_id, "initialized", None).await;

        // Context gathering is best-effort; planning works without it.
        self.publish_progress(task_id, "Gathering project context...", None)
            .await;
        match self
            .collaborators
            .context
            .gather_project_context(repo_root)
            .await
        {
            Ok(context) => {
                self.publish_progress(
                    task_id,
                    &format!("Context gathered: {} files analyzed", context.file_count),
                    None,
                )
                .await;
            }
            Err(e) => {
                tracing::warn!(task_id = %task_id, "context gathering failed: {:#}", e);
            }
        }

        self.state_machine
            .transition(task_id, WorkflowPhase::Planning, "START_PLANNING", None)
            .await?;
        self.publish_progress(
            task_id,
            "Planning task execution with full project context...",
            None,
        )
        .await;

        let plan = self.collaborators.planner.execution_plan(task_id).await?;
        self.publish_progress(
            task_id,
            &format!("Plan created with {} subtasks", plan.subtasks.len()),
            None,
        )
        .await;

        self.state_machine
            .transition(task_id, WorkflowPhase::Executing, "START_EXECUTION", None)
            .await?;

        for subtask in &plan.subtasks {
            self.state_machine
                .set_current_subtask(task_id, Some(&subtask.id))
                .await?;
            self.execute_subtask(task_id, subtask, repo_root).await?;
            self.state_machine.set_current_subtask(task_id, None).await?;
        }

        // Quality analysis never blocks delivery; low scores only reduce
        // confidence.
        let quality_score = self.run_quality_check(task_id, repo_root).await;

        self.state_machine
            .transition(task_id, WorkflowPhase::Testing, "START_TESTING", None)
            .await?;
        self.publish_progress(task_id, "Running comprehensive test suite...", None)
            .await;

        let report = self
            .collaborators
            .tests
            .run_tests(task_id, repo_root)
            .await?;

        self.gateway
            .dispatch(
                task_id,
                "command",
                json!({
                    "command": format!("{} tests", report.framework),
                    "exitCode": if report.failed > 0 { 1 } else { 0 },
                    "stdout": format!(
                        "Passed: {}, Failed: {}, Skipped: {}",
                        report.passed, report.failed, report.skipped
                    ),
                    "stderr": report
                        .failures
                        .iter()
                        .map(|f| f.message.as_str())
                        .collect::<Vec<_>>()
                        .join("\n"),
                    "duration": report.duration_ms,
                }),
            )
            .await;

        if report.failed > 0 {
            self.publish_progress(
                task_id,
                &format!("Tests failed: {} failures", report.failed),
                None,
            )
            .await;
            return Err(WorkflowError::TestFailure {
                failed: report.failed,
            }
            .into());
        }

        self.publish_progress(
            task_id,
            &format!("All tests passed! ({}/{})", report.passed, report.total),
            None,
        )
        .await;
        if let Some(coverage) = report.coverage {
            self.publish_progress(
                task_id,
                &format!("Code coverage: {}% lines", coverage.lines),
                None,
            )
            .await;
        }

        self.state_machine
            .transition(task_id, WorkflowPhase::Delivering, "START_DELIVERY", None)
            .await?;
        self.publish_progress(task_id, "Delivering results...", None)
            .await;

        let duration_ms = started.elapsed().as_millis() as u64;
        self.state_machine
            .mark_completed(task_id, Some("Task completed successfully"))
            .await?;
        self.publish_progress(
            task_id,
            &format!(
                "Task completed successfully in {}s",
                duration_ms.div_ceil(1000)
            ),
            Some(100),
        )
        .await;

        let mut metadata = serde_json::Map::new();
        metadata.insert("duration".to_string(), json!(duration_ms));
        metadata.insert("testsPassed".to_string(), json!(report.passed));
        if let Some(score) = quality_score {
            metadata.insert("qualityScore".to_string(), json!(score));
        }
        if let Some(coverage) = report.coverage {
            metadata.insert("coverage".to_string(), json!(coverage.lines));
        }
        self.emit_status(task_id, "completed", Some(Value::Object(metadata)))
            .await;

        Ok(())
    }

    /// A fresh task is initialized at IDLE; a task reset by an explicit
    /// external retry is already at IDLE. Anything else is a conflicting
    /// start and is rejected.
    async fn ensure_initialized(&self, task_id: &str) -> Result<()> {
        match self.state_machine.get_state(task_id).await {
            Err(WorkflowError::NotFound { .. }) => {
                self.state_machine.initialize_workflow(task_id).await?;
                Ok(())
            }
            Ok(state) if state.current_state == WorkflowPhase::Idle => Ok(()),
            Ok(_) => Err(WorkflowError::AlreadyExists {
                task_id: task_id.to_string(),
            }
            .into()),
            Err(e) => Err(e.into()),
        }
    }

    /// Non-fatal quality gate: analyze, report to subscribers, auto-format
    /// when the score clears the threshold. Returns the score when analysis
    /// succeeded.
    async fn run_quality_check(&self, task_id: &str, repo_root: &Path) -> Option<u32> {
        self.publish_progress(task_id, "Analyzing code quality...", None)
            .await;

        let report = match self.collaborators.quality.analyze_code(repo_root).await {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!(task_id = %task_id, "quality analysis failed: {:#}", e);
                return None;
            }
        };

        let issues: Vec<_> = report.issues.iter().take(MAX_REVIEW_ISSUES).collect();
        self.gateway
            .dispatch(
                task_id,
                "review",
                json!({
                    "file": "overall",
                    "issues": issues,
                    "suggestions": report.suggestions,
                }),
            )
            .await;
        self.publish_progress(
            task_id,
            &format!("Code quality score: {}/100", report.score),
            None,
        )
        .await;

        if report.score >= self.quality_format_threshold {
            match self.collaborators.quality.format_code(repo_root).await {
                Ok(()) => {
                    self.publish_progress(task_id, "Code formatted", None).await;
                }
                Err(e) => {
                    tracing::warn!(task_id = %task_id, "auto-format failed: {:#}", e);
                }
            }
        }

        Some(report.score)
    }

    /// Runs one subtask: file edits, then commands, then advisory
    /// verification. Edits are a best-effort batch (no rollback of edits
    /// that already succeeded); commands stop at the first failure.
    async fn execute_subtask(
        &self,
        task_id: &str,
        subtask: &Subtask,
        repo_root: &Path,
    ) -> Result<()> {
        let result = self.run_subtask(task_id, subtask, repo_root).await;
        if let Err(error) = &result {
            if let Err(sink_err) = self
                .collaborators
                .subtasks
                .update_status(
                    &subtask.id,
                    SubtaskStatus::Failed,
                    None,
                    Some(format!("{:#}", error)),
                )
                .await
            {
                tracing::warn!(
                    subtask = %subtask.id,
                    "failed to record subtask failure: {:#}",
                    sink_err
                );
            }
        }
        result
    }

    async fn run_subtask(&self, task_id: &str, subtask: &Subtask, repo_root: &Path) -> Result<()> {
        self.publish_progress(task_id, &format!("Executing: {}", subtask.description), None)
            .await;
        self.collaborators
            .subtasks
            .update_status(&subtask.id, SubtaskStatus::Running, None, None)
            .await?;

        if !subtask.files_to_edit.is_empty() {
            self.publish_progress(
                task_id,
                &format!("Modifying {} file(s)...", subtask.files_to_edit.len()),
                None,
            )
            .await;

            let change = subtask
                .code_changes
                .as_deref()
                .unwrap_or("Apply changes as planned");
            for file in &subtask.files_to_edit {
                let path = repo_root.join(file);
                let outcome = self
                    .collaborators
                    .editor
                    .apply_change(&path, change)
                    .await?;
                if !outcome.success {
                    return Err(WorkflowError::SubtaskFailure {
                        subtask_id: subtask.id.clone(),
                        message: format!(
                            "edit of {} failed: {}",
                            file,
                            outcome.error.unwrap_or_else(|| "unknown error".to_string())
                        ),
                    }
                    .into());
                }
            }
        }

        if !subtask.commands_to_run.is_empty() {
            self.publish_progress(
                task_id,
                &format!("Running {} command(s)...", subtask.commands_to_run.len()),
                None,
            )
            .await;

            for command in &subtask.commands_to_run {
                let outcome = self
                    .collaborators
                    .commands
                    .run_with_auto_debug(task_id, command, repo_root, Some(&subtask.description))
                    .await?;
                if !outcome.success {
                    return Err(WorkflowError::SubtaskFailure {
                        subtask_id: subtask.id.clone(),
                        message: format!(
                            "Command failed: {}\nError: {}",
                            command, outcome.final_output.stderr
                        ),
                    }
                    .into());
                }
            }
        }

        self.verify_subtask(subtask, repo_root)?;

        self.collaborators
            .subtasks
            .update_status(&subtask.id, SubtaskStatus::Success, None, None)
            .await?;
        self.publish_progress(task_id, &format!("Completed: {}", subtask.description), None)
            .await;
        Ok(())
    }

    /// Advisory verification of the plan's success conditions. Only the
    /// `file exists: <path>` form is checked; unrecognized conditions are
    /// skipped.
    fn verify_subtask(&self, subtask: &Subtask, repo_root: &Path) -> Result<()> {
        for condition in &subtask.success_conditions {
            match parse_file_exists_condition(condition) {
                Some(path) if repo_root.join(&path).exists() => {}
                Some(path) => {
                    return Err(WorkflowError::SubtaskFailure {
                        subtask_id: subtask.id.clone(),
                        message: format!("verification failed: file {} does not exist", path),
                    }
                    .into());
                }
                None => {
                    tracing::debug!(
                        subtask = %subtask.id,
                        condition = %condition,
                        "unrecognized success condition skipped"
                    );
                }
            }
        }
        Ok(())
    }

    /// Converts a failure into a bounded retry or terminal failure. Below
    /// the bound the task transitions to RETRYING and is then still marked
    /// FAILED: execution does not resume inline, an explicit external retry
    /// (which resets the counter) is required. At the bound, the counter
    /// stays pinned at the maximum.
    pub async fn handle_task_failure(&self, task_id: &str, error: &anyhow::Error) {
        tracing::error!(task_id = %task_id, "task failed: {:#}", error);

        let current_retries = match self.state_machine.get_state(task_id).await {
            Ok(state) => state.retry_count,
            Err(e) => {
                tracing::error!(task_id = %task_id, "cannot record failure: {}", e);
                return;
            }
        };

        if current_retries < self.max_retries {
            let retry_count = match self.state_machine.increment_retry(task_id).await {
                Ok(count) => count,
                Err(e) => {
                    tracing::error!(task_id = %task_id, "retry bookkeeping failed: {}", e);
                    return;
                }
            };

            if retry_count < self.max_retries {
                self.publish_progress(
                    task_id,
                    &format!(
                        "Task failed, retrying ({}/{})...",
                        retry_count, self.max_retries
                    ),
                    None,
                )
                .await;

                let metadata = HashMap::from([
                    ("error".to_string(), json!(format!("{:#}", error))),
                    ("retryCount".to_string(), json!(retry_count)),
                ]);
                // RETRYING is only reachable from DEBUGGING and FAILED, so
                // this is rejected for most failure points; the FAILED
                // transition below is what actually lands.
                if let Err(e) = self
                    .state_machine
                    .transition(task_id, WorkflowPhase::Retrying, "RETRY", Some(metadata))
                    .await
                {
                    tracing::warn!(task_id = %task_id, "retry transition rejected: {}", e);
                }
            } else {
                let exhausted = WorkflowError::RetryExhausted {
                    retries: retry_count,
                };
                self.publish_progress(
                    task_id,
                    &format!("Task failed ({}): {:#}", exhausted, error),
                    None,
                )
                .await;
            }
        } else {
            // Counter already at the bound; a further failure must not
            // exceed it.
            let exhausted = WorkflowError::RetryExhausted {
                retries: current_retries,
            };
            self.publish_progress(
                task_id,
                &format!("Task failed ({}): {:#}", exhausted, error),
                None,
            )
            .await;
        }

        if let Err(e) = self
            .state_machine
            .mark_failed(task_id, &format!("{:#}", error))
            .await
        {
            tracing::error!(task_id = %task_id, "failed to mark task failed: {}", e);
        }
    }

    /// Publishes a human-readable progress message through both the durable
    /// bus and the gateway. Both are attempted; either failing is logged.
    pub async fn publish_progress(&self, task_id: &str, message: &str, progress: Option<u8>) {
        let payload = json!({
            "taskId": task_id,
            "message": message,
            "progress": progress,
            "timestamp": Utc::now().to_rfc3339(),
        });

        if let Err(e) = self
            .bus
            .publish(TASK_PROGRESS_TOPIC, payload.clone())
            .await
        {
            tracing::warn!(task_id = %task_id, "progress publish failed: {}", e);
        }
        self.gateway.dispatch(task_id, "progress", payload).await;
    }

    async fn emit_status(&self, task_id: &str, status: &str, metadata: Option<Value>) {
        self.gateway
            .dispatch(
                task_id,
                "status",
                json!({
                    "taskId": task_id,
                    "status": status,
                    "metadata": metadata,
                }),
            )
            .await;
    }

    /// Read-only aggregate: current state plus per-subtask completion counts.
    pub async fn get_task_progress(&self, task_id: &str) -> Result<TaskProgress, WorkflowError> {
        let state = self.state_machine.get_state(task_id).await?;

        let (completed, total) = match self.collaborators.planner.execution_plan(task_id).await {
            Ok(plan) => {
                let statuses = self.collaborators.subtasks.snapshot().await;
                let completed = plan
                    .subtasks
                    .iter()
                    .filter(|s| statuses.get(&s.id) == Some(&SubtaskStatus::Success))
                    .count();
                (completed, plan.subtasks.len())
            }
            // A task may not have a plan yet; that is not an error here.
            Err(_) => (0, 0),
        };

        Ok(TaskProgress {
            task_id: state.task_id,
            current_state: state.current_state,
            progress: state.progress,
            completed_subtasks: completed,
            total_subtasks: total,
            retry_count: state.retry_count,
            history: state.history,
            last_error: state.last_error,
        })
    }
}

fn parse_file_exists_condition(condition: &str) -> Option<String> {
    static PATTERN: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        regex::Regex::new(r"^\s*file exists:\s*(.+?)\s*$").unwrap_or_else(|e| {
            unreachable!("invalid literal regex: {}", e)
        })
    });
    pattern
        .captures(condition)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}
