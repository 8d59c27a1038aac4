//! Orchestrator configuration stored under `.pods/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::backoff::BackoffPolicy;

/// Orchestrator configuration (TOML).
///
/// Edited by humans; missing fields fall back to the defaults below.
/// Durations use humantime notation (`"500ms"`, `"5m"`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Attempts per Pod before it is rejected (Pods may override).
    pub max_attempts: u32,

    /// Wall-clock budget for all Workers of one attempt.
    #[serde(with = "humantime_serde")]
    pub execution_timeout: Duration,

    /// Consecutive step failures that open a step's circuit.
    pub failure_threshold: u32,

    /// How long an open circuit refuses invocations.
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,

    /// Retries per workflow step after the first try.
    pub max_retries: u32,

    #[serde(with = "humantime_serde")]
    pub backoff_base: Duration,

    #[serde(with = "humantime_serde")]
    pub backoff_max: Duration,

    /// Workflow steps allowed to run at the same time.
    pub concurrency_limit: usize,

    /// Interval between existence checks while waiting on a document or lock.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    #[serde(with = "humantime_serde")]
    pub lock_timeout: Duration,

    /// Lock files untouched for this long are left over from a crashed
    /// writer and get broken.
    #[serde(with = "humantime_serde")]
    pub stale_lock_after: Duration,

    /// Steps slower than this are reported as slow.
    #[serde(with = "humantime_serde")]
    pub slow_pod_threshold: Duration,

    /// Truncate command worker stdout/stderr beyond this many bytes.
    pub worker_output_limit_bytes: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            execution_timeout: Duration::from_secs(5 * 60),
            failure_threshold: 3,
            cooldown: Duration::from_secs(60),
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            concurrency_limit: 4,
            poll_interval: Duration::from_millis(50),
            lock_timeout: Duration::from_secs(10),
            stale_lock_after: Duration::from_secs(5 * 60),
            slow_pod_threshold: Duration::from_secs(60),
            worker_output_limit_bytes: 100_000,
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(anyhow!("max_attempts must be > 0"));
        }
        if self.execution_timeout.is_zero() {
            return Err(anyhow!("execution_timeout must be > 0"));
        }
        if self.failure_threshold == 0 {
            return Err(anyhow!("failure_threshold must be > 0"));
        }
        if self.concurrency_limit == 0 {
            return Err(anyhow!("concurrency_limit must be > 0"));
        }
        if self.poll_interval.is_zero() {
            return Err(anyhow!("poll_interval must be > 0"));
        }
        if self.lock_timeout.is_zero() {
            return Err(anyhow!("lock_timeout must be > 0"));
        }
        if self.stale_lock_after.is_zero() {
            return Err(anyhow!("stale_lock_after must be > 0"));
        }
        if self.backoff_max < self.backoff_base {
            return Err(anyhow!("backoff_max must be >= backoff_base"));
        }
        if self.worker_output_limit_bytes == 0 {
            return Err(anyhow!("worker_output_limit_bytes must be > 0"));
        }
        Ok(())
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.backoff_base, self.backoff_max)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `OrchestratorConfig::default()`.
pub fn load_config(path: &Path) -> Result<OrchestratorConfig> {
    if !path.exists() {
        return Ok(OrchestratorConfig::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: OrchestratorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &OrchestratorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf).with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
