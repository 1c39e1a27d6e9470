//! Process-local collaborator implementations used by the CLI wiring.
//!
//! These cover the collaborator seams that can be satisfied without an AI
//! completion provider: plans come from a YAML file, commands and tests run
//! through the shell with a hard timeout, quality is a configured lint
//! command, and context is a filesystem walk.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};
use tokio::process::Command;

use crate::collaborators::{
    CommandExecutor, CommandOutcome, CommandOutput, ContextGatherer, ContextSummary, EditOutcome,
    ExecutionPlan, FileEditor, IssueSeverity, Planner, QualityAnalyzer, QualityIssue,
    QualityReport, SubtaskSink, SubtaskStatus, TaskStatus, TaskStatusSink, TestFailureDetail,
    TestReport, TestRunner,
};
use crate::workflow::errors::WorkflowError;

const SKIPPED_DIRS: &[&str] = &[".git", "target", "node_modules", ".autodev"];

/// Loads execution plans from a YAML file mapping task id to plan.
pub struct YamlPlanner {
    path: PathBuf,
}

impl YamlPlanner {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl Planner for YamlPlanner {
    async fn execution_plan(&self, task_id: &str) -> Result<ExecutionPlan> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(WorkflowError::NotFound {
                    what: format!("plan file {}", self.path.display()),
                }
                .into());
            }
            Err(e) => {
                return Err(e).context(format!("reading plan file {}", self.path.display()))
            }
        };
        let plans: HashMap<String, ExecutionPlan> = serde_yaml::from_str(&content)
            .with_context(|| format!("parsing plan file {}", self.path.display()))?;
        plans.get(task_id).cloned().ok_or_else(|| {
            WorkflowError::NotFound {
                what: format!("execution plan for task {}", task_id),
            }
            .into()
        })
    }
}

async fn run_shell(command: &str, work_dir: &Path, timeout: Duration) -> Result<CommandOutput> {
    let started = Instant::now();
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(work_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        // The timeout below drops the output future; the child must die
        // with it rather than leak.
        .kill_on_drop(true);

    match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(output) => {
            let output = output.with_context(|| format!("spawning command: {}", command))?;
            Ok(CommandOutput {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                exit_code: output.status.code().unwrap_or(-1),
                duration_ms: started.elapsed().as_millis() as u64,
            })
        }
        Err(_) => Ok(CommandOutput {
            stdout: String::new(),
            stderr: format!("command timed out after {}s", timeout.as_secs()),
            exit_code: -1,
            duration_ms: started.elapsed().as_millis() as u64,
        }),
    }
}

/// Runs commands through `sh -c` with a hard timeout kill.
pub struct ShellCommandExecutor {
    timeout: Duration,
}

impl ShellCommandExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CommandExecutor for ShellCommandExecutor {
    async fn run_with_auto_debug(
        &self,
        task_id: &str,
        command: &str,
        work_dir: &Path,
        context: Option<&str>,
    ) -> Result<CommandOutcome> {
        tracing::debug!(
            task_id = %task_id,
            command = %command,
            context = context.unwrap_or(""),
            "running command"
        );
        let output = run_shell(command, work_dir, self.timeout).await?;
        Ok(CommandOutcome {
            success: output.exit_code == 0,
            final_output: output,
        })
    }
}

fn count_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(\d+)\s+(passed|failed|ignored|skipped)")
            .unwrap_or_else(|e| unreachable!("invalid literal regex: {}", e))
    })
}

/// Extracts (passed, failed, skipped) counts from test runner output.
/// Matches the `N passed` / `N failed` / `N ignored` phrasing shared by
/// cargo test and the common JS runners.
fn parse_test_counts(output: &str) -> Option<(u32, u32, u32)> {
    let mut passed = None;
    let mut failed = None;
    let mut skipped = 0;
    for caps in count_pattern().captures_iter(output) {
        let count: u32 = caps.get(1)?.as_str().parse().ok()?;
        match caps.get(2)?.as_str() {
            "passed" => passed = Some(passed.unwrap_or(0) + count),
            "failed" => failed = Some(failed.unwrap_or(0) + count),
            _ => skipped += count,
        }
    }
    match (passed, failed) {
        (None, None) => None,
        (p, f) => Some((p.unwrap_or(0), f.unwrap_or(0), skipped)),
    }
}

/// Runs the configured test command and derives a report from its output.
pub struct ShellTestRunner {
    command: String,
    timeout: Duration,
}

impl ShellTestRunner {
    pub fn new(command: String, timeout: Duration) -> Self {
        Self { command, timeout }
    }
}

#[async_trait]
impl TestRunner for ShellTestRunner {
    async fn run_tests(&self, task_id: &str, repo_root: &Path) -> Result<TestReport> {
        tracing::debug!(task_id = %task_id, command = %self.command, "running test suite");
        let output = run_shell(&self.command, repo_root, self.timeout).await?;

        let framework = self
            .command
            .split_whitespace()
            .next()
            .unwrap_or("tests")
            .to_string();
        let combined = format!("{}\n{}", output.stdout, output.stderr);

        let (passed, failed, skipped) = match parse_test_counts(&combined) {
            Some(counts) => counts,
            // Opaque runner output: fall back to the exit code.
            None if output.exit_code == 0 => (1, 0, 0),
            None => (0, 1, 0),
        };

        let failures = if failed > 0 {
            let tail: Vec<&str> = combined
                .lines()
                .filter(|l| !l.trim().is_empty())
                .rev()
                .take(10)
                .collect();
            vec![TestFailureDetail {
                test: "suite".to_string(),
                message: tail.into_iter().rev().collect::<Vec<_>>().join("\n"),
            }]
        } else {
            Vec::new()
        };

        Ok(TestReport {
            framework,
            passed,
            failed,
            skipped,
            total: passed + failed + skipped,
            duration_ms: output.duration_ms,
            coverage: None,
            failures,
        })
    }
}

/// Scores the repo with a configured lint command; with none configured the
/// analysis trivially passes.
pub struct ShellQualityAnalyzer {
    lint_command: Option<String>,
    format_command: Option<String>,
    timeout: Duration,
}

impl ShellQualityAnalyzer {
    pub fn new(
        lint_command: Option<String>,
        format_command: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            lint_command,
            format_command,
            timeout,
        }
    }
}

#[async_trait]
impl QualityAnalyzer for ShellQualityAnalyzer {
    async fn analyze_code(&self, repo_root: &Path) -> Result<QualityReport> {
        let Some(command) = &self.lint_command else {
            return Ok(QualityReport {
                score: 100,
                issues: Vec::new(),
                suggestions: Vec::new(),
            });
        };

        let output = run_shell(command, repo_root, self.timeout).await?;
        if output.exit_code == 0 {
            return Ok(QualityReport {
                score: 100,
                issues: Vec::new(),
                suggestions: Vec::new(),
            });
        }

        let issues: Vec<QualityIssue> = output
            .stderr
            .lines()
            .chain(output.stdout.lines())
            .filter(|l| !l.trim().is_empty())
            .take(50)
            .map(|line| QualityIssue {
                file: String::new(),
                line: 0,
                severity: IssueSeverity::Warning,
                message: line.to_string(),
            })
            .collect();
        let score = 100u32.saturating_sub(issues.len() as u32 * 5);

        Ok(QualityReport {
            score,
            issues,
            suggestions: vec![format!("Fix issues reported by: {}", command)],
        })
    }

    async fn format_code(&self, repo_root: &Path) -> Result<()> {
        if let Some(command) = &self.format_command {
            let output = run_shell(command, repo_root, self.timeout).await?;
            if output.exit_code != 0 {
                anyhow::bail!("format command failed: {}", output.stderr);
            }
        }
        Ok(())
    }
}

/// Walks the repository and summarizes its file layout.
pub struct FsContextGatherer;

#[async_trait]
impl ContextGatherer for FsContextGatherer {
    async fn gather_project_context(&self, repo_root: &Path) -> Result<ContextSummary> {
        let mut files = Vec::new();
        collect_files(repo_root, repo_root, &mut files)?;

        let mut by_extension: HashMap<String, usize> = HashMap::new();
        for file in &files {
            if let Some(ext) = file.extension().and_then(|e| e.to_str()) {
                *by_extension.entry(ext.to_string()).or_default() += 1;
            }
        }
        let mut extensions: Vec<(String, usize)> = by_extension.into_iter().collect();
        extensions.sort_by(|a, b| b.1.cmp(&a.1));

        let mut summary = format!("Project context:\n- Total files: {}\n", files.len());
        for (ext, count) in extensions.iter().take(8) {
            summary.push_str(&format!("- .{} files: {}\n", ext, count));
        }

        Ok(ContextSummary {
            file_count: files.len(),
            summary,
        })
    }
}

fn collect_files(dir: &Path, root: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("reading directory {}", dir.display()))?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            let skipped = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| SKIPPED_DIRS.contains(&n))
                .unwrap_or(false);
            if !skipped {
                collect_files(&path, root, files)?;
            }
        } else if let Ok(rel) = path.strip_prefix(root) {
            files.push(rel.to_path_buf());
        }
    }
    Ok(())
}

/// File editing needs the out-of-scope completion provider; the CLI wires
/// this until one is configured.
pub struct UnconfiguredFileEditor;

#[async_trait]
impl FileEditor for UnconfiguredFileEditor {
    async fn apply_change(
        &self,
        file_path: &Path,
        _change_description: &str,
    ) -> Result<EditOutcome> {
        Err(WorkflowError::CollaboratorUnavailable {
            name: "file-editor".to_string(),
            message: format!(
                "no completion provider configured (cannot edit {})",
                file_path.display()
            ),
        }
        .into())
    }
}

/// In-memory subtask status record.
#[derive(Default)]
pub struct MemorySubtaskSink {
    inner: Mutex<HashMap<String, SubtaskStatus>>,
}

impl MemorySubtaskSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubtaskSink for MemorySubtaskSink {
    async fn update_status(
        &self,
        subtask_id: &str,
        status: SubtaskStatus,
        output: Option<String>,
        error: Option<String>,
    ) -> Result<()> {
        tracing::debug!(
            subtask = %subtask_id,
            status = ?status,
            output = output.as_deref().unwrap_or(""),
            error = error.as_deref().unwrap_or(""),
            "subtask status"
        );
        self.inner
            .lock()
            .map_err(|_| anyhow::anyhow!("subtask sink lock poisoned"))?
            .insert(subtask_id.to_string(), status);
        Ok(())
    }

    async fn snapshot(&self) -> HashMap<String, SubtaskStatus> {
        self.inner
            .lock()
            .map(|inner| inner.clone())
            .unwrap_or_default()
    }
}

/// In-memory terminal task status record.
#[derive(Default)]
pub struct MemoryTaskStatusSink {
    inner: Mutex<HashMap<String, (TaskStatus, Option<DateTime<Utc>>)>>,
}

impl MemoryTaskStatusSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status_of(&self, task_id: &str) -> Option<TaskStatus> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.get(task_id).map(|(status, _)| *status))
    }

    pub fn completed_at(&self, task_id: &str) -> Option<DateTime<Utc>> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.get(task_id).and_then(|(_, at)| *at))
    }
}

#[async_trait]
impl TaskStatusSink for MemoryTaskStatusSink {
    async fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.inner
            .lock()
            .map_err(|_| anyhow::anyhow!("task status sink lock poisoned"))?
            .insert(task_id.to_string(), (status, completed_at));
        Ok(())
    }
}
