//! Orchestrator configuration, loaded from YAML with full defaults so an
//! empty (or absent) config file is valid.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OrchestratorConfig {
    /// Failures tolerated before a task is terminally failed.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Quality score at or above which the auto-format pass runs.
    #[serde(default = "default_quality_format_threshold")]
    pub quality_format_threshold: u32,
    /// TTL for the fast state cache.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Hard timeout for each sandboxed command.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    /// Command line used by the local test runner.
    #[serde(default = "default_test_command")]
    pub test_command: String,
    /// Optional lint command backing quality analysis.
    #[serde(default)]
    pub lint_command: Option<String>,
    /// Optional format command for the auto-format pass.
    #[serde(default)]
    pub format_command: Option<String>,
    /// Shared token listeners must present; unset accepts every connection.
    #[serde(default)]
    pub auth_token: Option<String>,
    /// Durable state directory, relative to the repository root.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

fn default_max_retries() -> u32 {
    3
}

fn default_quality_format_threshold() -> u32 {
    60
}

fn default_cache_ttl_secs() -> u64 {
    3600
}

fn default_command_timeout_secs() -> u64 {
    300
}

fn default_test_command() -> String {
    "cargo test".to_string()
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".autodev/state")
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            quality_format_threshold: default_quality_format_threshold(),
            cache_ttl_secs: default_cache_ttl_secs(),
            command_timeout_secs: default_command_timeout_secs(),
            test_command: default_test_command(),
            lint_command: None,
            format_command: None,
            auth_token: None,
            state_dir: default_state_dir(),
        }
    }
}

impl OrchestratorConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Loads the given config file, or falls back to defaults when none is
    /// supplied.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }
}
