use crate::error::{AppflowError, Result};
use crate::paths;
use crate::queue::RetryPolicy;
use crate::transition::{evaluate, Edge};
use crate::types::{ApplicationStatus, Role};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// PoolConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Job starts admitted per `window_ms`.
    #[serde(default = "default_max_jobs_per_window")]
    pub max_jobs_per_window: u32,
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    /// How long an idle worker sleeps before polling the queue again.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    #[serde(default = "default_notifier_capacity")]
    pub notifier_capacity: usize,
}

fn default_concurrency() -> usize {
    4
}

fn default_max_jobs_per_window() -> u32 {
    10
}

fn default_window_ms() -> u64 {
    1000
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_lease_secs() -> u64 {
    60
}

fn default_notifier_capacity() -> usize {
    256
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_jobs_per_window: default_max_jobs_per_window(),
            window_ms: default_window_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            lease_secs: default_lease_secs(),
            notifier_capacity: default_notifier_capacity(),
        }
    }
}

impl PoolConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }
}

// ---------------------------------------------------------------------------
// ReviewConfig
// ---------------------------------------------------------------------------

/// Provider edges held for an admin co-signature on top of what the
/// transition table itself flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewConfig {
    /// How long a job waits for a reviewer before it is looked at again.
    #[serde(default = "default_review_delay_secs")]
    pub delay_secs: u64,
    #[serde(default = "default_gated_edges")]
    pub gated_edges: Vec<Edge>,
}

fn default_review_delay_secs() -> u64 {
    300
}

fn default_gated_edges() -> Vec<Edge> {
    vec![
        Edge::new(ApplicationStatus::Pending, ApplicationStatus::Approved),
        Edge::new(ApplicationStatus::Rejected, ApplicationStatus::Approved),
    ]
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            delay_secs: default_review_delay_secs(),
            gated_edges: default_gated_edges(),
        }
    }
}

impl ReviewConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }

    pub fn gates(&self, edge: Edge) -> bool {
        self.gated_edges.contains(&edge)
    }
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub worker: PoolConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub review: ReviewConfig,
}

fn default_version() -> u32 {
    1
}

impl Config {
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Err(AppflowError::NotInitialized);
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let mut push = |level: WarnLevel, message: String| {
            warnings.push(ConfigWarning { level, message });
        };

        if self.worker.concurrency == 0 {
            push(
                WarnLevel::Error,
                "worker.concurrency is 0; no job will ever run".to_string(),
            );
        }
        if self.worker.max_jobs_per_window == 0 || self.worker.window_ms == 0 {
            push(
                WarnLevel::Error,
                "worker rate limit admits no jobs (max_jobs_per_window and window_ms must be > 0)"
                    .to_string(),
            );
        }
        if self.worker.lease_secs == 0 {
            push(
                WarnLevel::Warning,
                "worker.lease_secs is 0; every delivery can be reclaimed at once".to_string(),
            );
        }

        if self.retry.max_attempts == 0 {
            push(
                WarnLevel::Warning,
                "retry.max_attempts is 0; transient failures dead-letter on first try"
                    .to_string(),
            );
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            push(
                WarnLevel::Warning,
                format!(
                    "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                    self.retry.base_delay_ms, self.retry.max_delay_ms
                ),
            );
        }

        // Gating an edge the provider can never take has no effect.
        for edge in &self.review.gated_edges {
            if !evaluate(edge.from, edge.to, Role::Provider).legal {
                push(
                    WarnLevel::Warning,
                    format!("review.gated_edges: '{edge}' is not a legal provider transition"),
                );
            }
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
