//! Manager configuration

use crate::conflict::ConflictThresholds;
use crate::error::{KeelError, Result};
use crate::runtime::RetryPolicy;
use crate::validate::ResourceCeiling;
use crate::verify::DEFAULT_FATAL_PATTERNS;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Project name used when none is configured
pub const DEFAULT_PROJECT: &str = "keel";

/// Configuration for a lifecycle manager instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Compose project the manager owns
    #[serde(default = "default_project")]
    pub project: String,
    /// Root for snapshots and rendered compose files
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Run conflict detection before applying
    #[serde(default = "default_true")]
    pub detect_conflicts: bool,
    #[serde(default = "default_apply_timeout")]
    pub apply_timeout_secs: u64,
    #[serde(default = "default_observe_timeout")]
    pub observe_timeout_secs: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
    /// How long verification waits for healthchecks to leave `starting`
    #[serde(default = "default_health_wait")]
    pub health_wait_secs: u64,
    #[serde(default = "default_health_poll")]
    pub health_poll_ms: u64,
    /// Retries for transient engine failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
    #[serde(default)]
    pub resource_ceiling: ResourceCeiling,
    #[serde(default)]
    pub conflict_thresholds: ConflictThresholds,
    /// Log lines scanned for fatal markers per service
    #[serde(default = "default_log_window")]
    pub log_window_lines: usize,
    /// CPU usage above this percentage is flagged after a deploy
    #[serde(default = "default_baseline_cpu")]
    pub baseline_cpu_percent: u32,
    /// Memory usage above this percentage of the limit is flagged
    #[serde(default = "default_baseline_memory")]
    pub baseline_memory_percent: u32,
    #[serde(default = "default_fatal_patterns")]
    pub fatal_log_patterns: Vec<String>,
}

fn default_project() -> String {
    DEFAULT_PROJECT.to_string()
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("/var/lib"))
        .join("keel")
}

fn default_true() -> bool {
    true
}

fn default_apply_timeout() -> u64 {
    300
}

fn default_observe_timeout() -> u64 {
    30
}

fn default_probe_timeout() -> u64 {
    10
}

fn default_health_wait() -> u64 {
    60
}

fn default_health_poll() -> u64 {
    5000
}

fn default_baseline_cpu() -> u32 {
    50
}

fn default_baseline_memory() -> u32 {
    70
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_backoff() -> u64 {
    500
}

fn default_log_window() -> usize {
    200
}

fn default_fatal_patterns() -> Vec<String> {
    DEFAULT_FATAL_PATTERNS.iter().map(|p| p.to_string()).collect()
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            project: default_project(),
            data_dir: default_data_dir(),
            detect_conflicts: true,
            apply_timeout_secs: default_apply_timeout(),
            observe_timeout_secs: default_observe_timeout(),
            probe_timeout_secs: default_probe_timeout(),
            health_wait_secs: default_health_wait(),
            health_poll_ms: default_health_poll(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff(),
            resource_ceiling: ResourceCeiling::default(),
            conflict_thresholds: ConflictThresholds::default(),
            log_window_lines: default_log_window(),
            baseline_cpu_percent: default_baseline_cpu(),
            baseline_memory_percent: default_baseline_memory(),
            fatal_log_patterns: default_fatal_patterns(),
        }
    }
}

impl ManagerConfig {
    /// Load a YAML configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ManagerConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given, else `<default data dir>/config.yaml` when it
    /// exists, else defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        let fallback = default_data_dir().join("config.yaml");
        if fallback.exists() {
            tracing::debug!("Loading configuration from {}", fallback.display());
            return Self::load(&fallback);
        }
        Ok(Self::default())
    }

    /// Reject values the manager cannot run with
    pub fn validate(&self) -> Result<()> {
        let valid_project = !self.project.is_empty()
            && self
                .project
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
        if !valid_project {
            return Err(KeelError::InvalidConfig(format!(
                "project name '{}' must be lowercase alphanumerics, '-' or '_'",
                self.project
            )));
        }

        if self.apply_timeout_secs == 0
            || self.observe_timeout_secs == 0
            || self.probe_timeout_secs == 0
        {
            return Err(KeelError::InvalidConfig("timeouts must be positive".to_string()));
        }
        if self.health_poll_ms == 0 {
            return Err(KeelError::InvalidConfig("health_poll_ms must be positive".to_string()));
        }

        let thresholds = &self.conflict_thresholds;
        if thresholds.advisory_ratio <= 0.0 {
            return Err(KeelError::InvalidConfig(
                "conflict_thresholds.advisory_ratio must be positive".to_string(),
            ));
        }
        if let Some(blocking) = thresholds.blocking_ratio {
            if blocking < thresholds.advisory_ratio {
                return Err(KeelError::InvalidConfig(
                    "conflict_thresholds.blocking_ratio is below advisory_ratio".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Retry policy for applies and teardowns
    pub fn apply_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff: Duration::from_millis(self.retry_backoff_ms),
            timeout: Duration::from_secs(self.apply_timeout_secs),
        }
    }

    /// Retry policy for live-state observation
    pub fn observe_policy(&self) -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_secs(self.observe_timeout_secs),
            ..self.apply_policy()
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn health_wait(&self) -> Duration {
        Duration::from_secs(self.health_wait_secs)
    }

    pub fn health_poll(&self) -> Duration {
        Duration::from_millis(self.health_poll_ms)
    }

    /// Snapshot directory for the configured project
    pub fn backup_dir(&self) -> PathBuf {
        self.data_dir.join("snapshots").join(&self.project)
    }

    /// Directory rendered compose files are written to
    pub fn compose_dir(&self) -> PathBuf {
        self.data_dir.join("compose")
    }
}
