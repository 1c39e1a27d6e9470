//! Contracts for the external collaborators the workflow core drives.
//!
//! The core never implements an AI completion capability, source control, or
//! a sandbox itself; it consumes them through these seams. `src/exec.rs`
//! provides process-local implementations for the CLI, and the module tests
//! substitute recording mocks.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// An ordered execution plan produced upstream of the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub subtasks: Vec<Subtask>,
}

/// One step of a plan: a file edit batch and/or a command sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub files_to_edit: Vec<String>,
    /// Natural-language change description handed to the file editor.
    #[serde(default)]
    pub code_changes: Option<String>,
    #[serde(default)]
    pub commands_to_run: Vec<String>,
    /// Advisory checks, e.g. `file exists: src/lib.rs`.
    #[serde(default)]
    pub success_conditions: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubtaskStatus {
    Running,
    Success,
    Failed,
}

/// Terminal status reported to the external task record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Success,
    Failed,
}

/// Result of applying one file change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Captured output of one sandboxed command run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_ms: u64,
}

/// Outcome of a command run through the auto-debugging executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub success: bool,
    pub final_output: CommandOutput,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestFailureDetail {
    pub test: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CoverageSummary {
    /// Percentage of lines covered.
    pub lines: f64,
}

/// Aggregate result of a test suite run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestReport {
    pub framework: String,
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub total: u32,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage: Option<CoverageSummary>,
    #[serde(default)]
    pub failures: Vec<TestFailureDetail>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityIssue {
    pub file: String,
    pub line: u32,
    pub severity: IssueSeverity,
    pub message: String,
}

/// Static-analysis report, score 0-100.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityReport {
    pub score: u32,
    #[serde(default)]
    pub issues: Vec<QualityIssue>,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

/// Best-effort summary of the repository used to enrich planning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSummary {
    pub file_count: usize,
    pub summary: String,
}

/// Retrieves the previously-computed execution plan for a task.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn execution_plan(&self, task_id: &str) -> Result<ExecutionPlan>;
}

/// Records per-subtask status and exposes a snapshot for progress reporting.
#[async_trait]
pub trait SubtaskSink: Send + Sync {
    async fn update_status(
        &self,
        subtask_id: &str,
        status: SubtaskStatus,
        output: Option<String>,
        error: Option<String>,
    ) -> Result<()>;

    async fn snapshot(&self) -> HashMap<String, SubtaskStatus>;
}

/// Applies a described change to one file (the AI completion seam).
#[async_trait]
pub trait FileEditor: Send + Sync {
    async fn apply_change(&self, file_path: &Path, change_description: &str)
        -> Result<EditOutcome>;
}

/// Runs one command in the sandbox, with auto-debug retry behind the seam.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run_with_auto_debug(
        &self,
        task_id: &str,
        command: &str,
        work_dir: &Path,
        context: Option<&str>,
    ) -> Result<CommandOutcome>;
}

#[async_trait]
pub trait TestRunner: Send + Sync {
    async fn run_tests(&self, task_id: &str, repo_root: &Path) -> Result<TestReport>;
}

#[async_trait]
pub trait QualityAnalyzer: Send + Sync {
    async fn analyze_code(&self, repo_root: &Path) -> Result<QualityReport>;
    async fn format_code(&self, repo_root: &Path) -> Result<()>;
}

/// Best-effort project context gathering; failure never aborts a phase.
#[async_trait]
pub trait ContextGatherer: Send + Sync {
    async fn gather_project_context(&self, repo_root: &Path) -> Result<ContextSummary>;
}

/// Records the terminal status of the external task record.
#[async_trait]
pub trait TaskStatusSink: Send + Sync {
    async fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<()>;
}
