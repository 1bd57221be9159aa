//! Runtime configuration
//!
//! [`RuntimeConfig`] is plain serde data. It can be embedded in a pipeline
//! definition under `runtime:`, loaded from its own YAML file, and adjusted
//! through `PIPELINE_*` environment variables.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::error::{PipelineError, Result};
use crate::retry::RetryPolicy;

/// Largest value any concurrency limit may take
pub const MAX_CONCURRENCY_LIMIT: usize = Semaphore::MAX_PERMITS;

/// Rejects concurrency limits a semaphore cannot hold
pub(crate) fn check_limit(name: &str, value: usize) -> Result<()> {
    if value == 0 || value > MAX_CONCURRENCY_LIMIT {
        return Err(PipelineError::Configuration(format!(
            "{name} must be between 1 and {MAX_CONCURRENCY_LIMIT}, got {value}"
        )));
    }
    Ok(())
}

/// Permit count for a limit that may have skipped validation
pub(crate) fn permit_count(limit: usize) -> usize {
    limit.clamp(1, MAX_CONCURRENCY_LIMIT)
}

/// Limits and defaults applied to every run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Units running at once within one graph level
    pub max_concurrency: usize,

    /// Deadline for a top-level run; hitting it cancels the run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_timeout_ms: Option<u64>,

    /// Default timeout for join edges that do not set their own
    #[serde(skip_serializing_if = "Option::is_none")]
    pub join_timeout_ms: Option<u64>,

    /// How long a cancelled run waits for in-flight units before detaching them
    pub drain_grace_ms: u64,

    /// Maximum depth of nested sub-pipeline and batch runs
    pub max_nesting_depth: usize,

    /// Retry defaults for units without their own policy
    pub retry: RetryConfig,

    /// Defaults for batch units built from definitions
    pub batch: BatchDefaults,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            run_timeout_ms: None,
            join_timeout_ms: None,
            drain_grace_ms: 5_000,
            max_nesting_depth: 8,
            retry: RetryConfig::default(),
            batch: BatchDefaults::default(),
        }
    }
}

/// Serializable form of a [`RetryPolicy`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay_ms: 500,
            backoff_multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter: false,
        }
    }
}

impl RetryConfig {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries)
            .with_base_delay(Duration::from_millis(self.base_delay_ms))
            .with_backoff_multiplier(self.backoff_multiplier)
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_jitter(self.jitter)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(PipelineError::Configuration(format!(
                "backoff_multiplier must be a finite number >= 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(PipelineError::Configuration(format!(
                "max_delay_ms ({}) is smaller than base_delay_ms ({})",
                self.max_delay_ms, self.base_delay_ms
            )));
        }
        Ok(())
    }
}

/// Defaults for batch units
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchDefaults {
    pub max_concurrent: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_timeout_ms: Option<u64>,
    pub continue_on_error: bool,
}

impl Default for BatchDefaults {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            item_timeout_ms: None,
            continue_on_error: false,
        }
    }
}

impl RuntimeConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn validate(&self) -> Result<()> {
        check_limit("max_concurrency", self.max_concurrency)?;
        if self.max_nesting_depth == 0 {
            return Err(PipelineError::Configuration(
                "max_nesting_depth must be at least 1".to_string(),
            ));
        }
        check_limit("batch.max_concurrent", self.batch.max_concurrent)?;
        self.retry.validate()
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_ms.map(Duration::from_millis)
    }

    pub fn join_timeout(&self) -> Option<Duration> {
        self.join_timeout_ms.map(Duration::from_millis)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }

    /// Applies `PIPELINE_*` variables from the process environment
    pub fn apply_env_overrides(self) -> Result<Self> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Applies overrides from any variable lookup
    pub fn apply_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_var(&lookup, "PIPELINE_MAX_CONCURRENCY")? {
            self.max_concurrency = v;
        }
        if let Some(v) = parse_var(&lookup, "PIPELINE_RUN_TIMEOUT_MS")? {
            self.run_timeout_ms = Some(v);
        }
        if let Some(v) = parse_var(&lookup, "PIPELINE_JOIN_TIMEOUT_MS")? {
            self.join_timeout_ms = Some(v);
        }
        if let Some(v) = parse_var(&lookup, "PIPELINE_DRAIN_GRACE_MS")? {
            self.drain_grace_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "PIPELINE_MAX_NESTING_DEPTH")? {
            self.max_nesting_depth = v;
        }
        if let Some(v) = parse_var(&lookup, "PIPELINE_MAX_RETRIES")? {
            self.retry.max_retries = v;
        }
        self.validate()?;
        Ok(self)
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| PipelineError::Configuration(format!("{name}={raw}: {e}"))),
        None => Ok(None),
    }
}
