//! Project configuration (`keel.toml`)
//!
//! Looked up in the working directory first, then in the user config
//! directory (`~/.config/keel/config.toml` on Linux). Command-line flags and
//! `KEEL_*` environment variables override file values.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use stackgraph::{DEFAULT_MAX_CONCURRENCY, ReplacePolicy, RetryConfig};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Project config file name
pub const CONFIG_FILE: &str = "keel.toml";

const DEFAULT_STACK: &str = "stack.toml";
const DEFAULT_STATE_DIR: &str = ".keel/state";

/// Get the user config directory
pub fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("keel"))
}

/// Expand `~` and environment variables in a configured path
pub fn expand_path(raw: &str) -> PathBuf {
    let expanded = shellexpand::full(raw).unwrap_or(std::borrow::Cow::Borrowed(raw));
    PathBuf::from(expanded.as_ref())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KeelConfig {
    /// Stack declaration file
    pub stack: Option<String>,
    /// State directory
    pub state_dir: Option<String>,
    pub execution: ExecutionConfig,
    pub retry: RetrySection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutionConfig {
    /// Fixed worker count; unset derives it from the plan
    pub jobs: Option<usize>,
    /// Cap on the derived worker count
    pub max_jobs: usize,
    pub rollback_on_cancel: bool,
    pub replace_policy: ReplacePolicy,
    pub timeout_secs: Option<u64>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            jobs: None,
            max_jobs: DEFAULT_MAX_CONCURRENCY,
            rollback_on_cancel: false,
            replace_policy: ReplacePolicy::Refuse,
            timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        let defaults = RetryConfig::default();
        Self {
            max_attempts: defaults.max_attempts,
            base_delay_ms: defaults.base_delay.as_millis() as u64,
            backoff_factor: defaults.backoff_factor,
            max_delay_ms: defaults.max_delay.as_millis() as u64,
        }
    }
}

impl RetrySection {
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.base_delay_ms),
            backoff_factor: self.backoff_factor,
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

impl KeelConfig {
    /// Parse a config file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Could not read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Invalid config in {}", path.display()))
    }

    /// Locate and load the project config
    ///
    /// An explicit path must exist. Otherwise a missing file yields defaults.
    pub fn discover(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = explicit {
            return Ok((Self::load(path)?, Some(path.to_path_buf())));
        }

        let candidates = [
            Some(PathBuf::from(CONFIG_FILE)),
            config_dir().map(|d| d.join("config.toml")),
        ];
        for path in candidates.into_iter().flatten() {
            if path.is_file() {
                log::debug!("Using config {}", path.display());
                return Ok((Self::load(&path)?, Some(path)));
            }
        }

        log::debug!("No {CONFIG_FILE} found, using defaults");
        Ok((Self::default(), None))
    }
}

/// Effective settings after applying command-line overrides
#[derive(Debug, Clone)]
pub struct Settings {
    pub stack: PathBuf,
    pub state_dir: PathBuf,
    pub execution: ExecutionConfig,
    pub retry: RetryConfig,
    /// File the settings were read from, if any
    pub source: Option<PathBuf>,
}

impl Settings {
    pub fn resolve(
        config: KeelConfig,
        source: Option<PathBuf>,
        stack: Option<PathBuf>,
        state_dir: Option<PathBuf>,
    ) -> Self {
        let stack = stack.unwrap_or_else(|| expand_path(config.stack.as_deref().unwrap_or(DEFAULT_STACK)));
        let state_dir = state_dir
            .unwrap_or_else(|| expand_path(config.state_dir.as_deref().unwrap_or(DEFAULT_STATE_DIR)));
        Self {
            stack,
            state_dir,
            retry: config.retry.to_retry_config(),
            execution: config.execution,
            source,
        }
    }
}
