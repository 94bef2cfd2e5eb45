//! Configuration models for batchwise.
//!
//! Every tunable of the execution core lives here. Values are loaded from a
//! TOML file and validated up front so that a bad bound fails at startup
//! rather than halfway through a run.

use super::ErrorCategory;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

/// Top-level configuration for batchwise.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Pipeline identity and run policy
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Work unit sizing
    #[serde(default)]
    pub sizing: SizingConfig,

    /// Worker pool settings
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Retry with backoff for unit functions
    #[serde(default)]
    pub retry: RetryConfig,

    /// Checkpoint persistence
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
}

/// Pipeline identity and run policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pipeline name, used to key checkpoints
    #[serde(default = "default_pipeline_name")]
    pub name: String,

    /// What a failed unit means for the run
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Resume from the latest checkpoint when one exists
    #[serde(default)]
    pub resume: bool,
}

fn default_pipeline_name() -> String {
    "default".to_string()
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            name: default_pipeline_name(),
            failure_policy: FailurePolicy::default(),
            resume: false,
        }
    }
}

/// How the engine treats failure slots returned by dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Any failed unit fails the step and stops the run
    #[default]
    FailRun,
    /// Failed units drop their rows; the run continues
    SkipFailedUnits,
}

/// Strategy used to size work units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizingStrategy {
    /// Resize after every unit toward a target duration
    #[default]
    Adaptive,
    /// One static size derived from a sampled row footprint
    MemoryBounded,
    /// Always `initial_batch_size`
    Fixed,
}

/// Work unit sizing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizingConfig {
    #[serde(default)]
    pub strategy: SizingStrategy,

    /// Size of the first unit
    #[serde(default = "default_initial_batch_size")]
    pub initial_batch_size: usize,

    /// Lower bound for any unit
    #[serde(default = "default_min_batch_size")]
    pub min_batch_size: usize,

    /// Upper bound for adaptive growth
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Duration each unit should take, in milliseconds
    #[serde(default = "default_target_duration_ms")]
    pub target_duration_ms: u64,

    /// Memory ceiling for the memory-bounded sizer, in MiB
    #[serde(default = "default_memory_ceiling_mb")]
    pub memory_ceiling_mb: u64,

    /// Rows sampled to estimate the per-row footprint
    #[serde(default = "default_sample_rows")]
    pub sample_rows: usize,
}

fn default_initial_batch_size() -> usize {
    1000
}

fn default_min_batch_size() -> usize {
    100
}

fn default_max_batch_size() -> usize {
    10_000
}

fn default_target_duration_ms() -> u64 {
    1000
}

fn default_memory_ceiling_mb() -> u64 {
    512
}

fn default_sample_rows() -> usize {
    1000
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            strategy: SizingStrategy::default(),
            initial_batch_size: default_initial_batch_size(),
            min_batch_size: default_min_batch_size(),
            max_batch_size: default_max_batch_size(),
            target_duration_ms: default_target_duration_ms(),
            memory_ceiling_mb: default_memory_ceiling_mb(),
            sample_rows: default_sample_rows(),
        }
    }
}

impl SizingConfig {
    pub fn target_duration(&self) -> Duration {
        Duration::from_millis(self.target_duration_ms)
    }

    pub fn memory_ceiling_bytes(&self) -> u64 {
        self.memory_ceiling_mb.saturating_mul(1024 * 1024)
    }

    /// Validate bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_batch_size == 0 {
            return Err(ConfigError::invalid("sizing.min_batch_size", "must be at least 1"));
        }
        if self.min_batch_size > self.max_batch_size {
            return Err(ConfigError::invalid(
                "sizing.min_batch_size",
                format!(
                    "min_batch_size ({}) is greater than max_batch_size ({})",
                    self.min_batch_size, self.max_batch_size
                ),
            ));
        }
        if self.initial_batch_size < self.min_batch_size
            || self.initial_batch_size > self.max_batch_size
        {
            return Err(ConfigError::invalid(
                "sizing.initial_batch_size",
                format!(
                    "{} is outside [{}, {}]",
                    self.initial_batch_size, self.min_batch_size, self.max_batch_size
                ),
            ));
        }
        if self.target_duration_ms == 0 {
            return Err(ConfigError::invalid(
                "sizing.target_duration_ms",
                "must be greater than zero",
            ));
        }
        if self.memory_ceiling_mb == 0 {
            return Err(ConfigError::invalid(
                "sizing.memory_ceiling_mb",
                "must be greater than zero",
            ));
        }
        if self.sample_rows == 0 {
            return Err(ConfigError::invalid("sizing.sample_rows", "must be at least 1"));
        }
        Ok(())
    }
}

/// How units are driven.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// One unit at a time, sized between units
    #[default]
    Sequential,
    /// Pre-split units over the bounded worker pool
    Parallel,
}

/// Memory-aliasing contract between workers and the dataset.
///
/// `Shared` workers read rows through a common read-only handle; nothing is
/// copied, and no worker can mutate what a sibling sees. `Isolated` workers
/// each receive a private copy of their rows before submission, so a unit
/// holds no reference into the source dataset or any sibling's memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Shared,
    Isolated,
}

/// Worker pool configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default)]
    pub mode: DispatchMode,

    /// Pool size; defaults to available hardware parallelism
    #[serde(default)]
    pub workers: Option<usize>,

    #[serde(default)]
    pub execution: ExecutionMode,
}

impl DispatchConfig {
    /// Resolve the pool size.
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(default_worker_count)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == Some(0) {
            return Err(ConfigError::invalid("dispatch.workers", "must be at least 1"));
        }
        Ok(())
    }
}

/// Available hardware parallelism, or 1 when it cannot be queried.
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the second attempt, in milliseconds
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Delay multiplier between attempts
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Cap on any single delay, in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Failure categories worth another attempt
    #[serde(default = "default_retryable")]
    pub retryable: Vec<ErrorCategory>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_retryable() -> Vec<ErrorCategory> {
    vec![
        ErrorCategory::Transient,
        ErrorCategory::Timeout,
        ErrorCategory::Io,
    ]
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            backoff_factor: default_backoff_factor(),
            max_delay_ms: default_max_delay_ms(),
            retryable: default_retryable(),
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("retry.max_attempts", "must be at least 1"));
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(ConfigError::invalid(
                "retry.backoff_factor",
                format!("{} must be a finite value >= 1.0", self.backoff_factor),
            ));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(ConfigError::invalid(
                "retry.initial_delay_ms",
                format!(
                    "initial delay ({}ms) exceeds max delay ({}ms)",
                    self.initial_delay_ms, self.max_delay_ms
                ),
            ));
        }
        Ok(())
    }
}

/// Checkpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Write a checkpoint after every completed step
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Storage root; supports ${ENV_VAR} expansion
    #[serde(default = "default_checkpoint_root")]
    pub root: String,

    /// Retention: keep this many most recent checkpoints per pipeline
    #[serde(default = "default_keep_last")]
    pub keep_last: Option<usize>,
}

fn default_true() -> bool {
    true
}

fn default_checkpoint_root() -> String {
    "checkpoints".to_string()
}

fn default_keep_last() -> Option<usize> {
    Some(5)
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            root: default_checkpoint_root(),
            keep_last: default_keep_last(),
        }
    }
}

impl CheckpointConfig {
    /// Storage root with environment variables expanded.
    pub fn resolved_root(&self) -> PathBuf {
        PathBuf::from(expand_env_vars(&self.root))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.keep_last == Some(0) {
            return Err(ConfigError::invalid(
                "checkpoint.keep_last",
                "must be at least 1 (omit it to keep everything)",
            ));
        }
        if self.root.trim().is_empty() {
            return Err(ConfigError::invalid("checkpoint.root", "must not be empty"));
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_owned(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.name.trim().is_empty() {
            return Err(ConfigError::invalid("pipeline.name", "must not be empty"));
        }
        self.sizing.validate()?;
        self.dispatch.validate()?;
        self.retry.validate()?;
        self.checkpoint.validate()?;
        Ok(())
    }
}

fn env_var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{([^}]+)\}").expect("static pattern is valid"))
}

/// Expand environment variables in a string.
///
/// Supports ${VAR_NAME} syntax.
/// If the variable is not set, the placeholder is left unchanged.
pub fn expand_env_vars(s: &str) -> String {
    let mut result = s.to_string();

    for cap in env_var_pattern().captures_iter(s) {
        let var_name = &cap[1];
        if let Ok(value) = std::env::var(var_name) {
            result = result.replace(&cap[0], &value);
        }
    }

    result
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
