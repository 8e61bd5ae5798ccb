//! rollgrid.toml configuration parser.
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! usable engine configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub reconcile: ReconcileConfig,
    pub rollout: RolloutConfig,
}

/// Bounds on a single reconciliation and on the driver loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Upper bound on one whole invocation.
    pub timeout_secs: u64,
    /// Upper bound on each collaborator call (store read, workload write).
    pub call_timeout_secs: u64,
    /// Driver tick.
    pub resync_interval_secs: u64,
    /// Attempts at a conditional status write before giving up.
    pub status_update_attempts: u32,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            call_timeout_secs: 15,
            resync_interval_secs: 5,
            status_update_attempts: 5,
        }
    }
}

/// Policy knobs for the rollout state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloutConfig {
    /// Seconds a batch may spend between applying its target and becoming ready.
    pub health_gate_timeout_secs: u64,
    /// Seconds an unclaimed workload may stay missing before the rollout fails.
    pub not_found_grace_secs: u64,
    pub not_found_retry_secs: u64,
    pub conflict_backoff_secs: u64,
    pub not_ready_retry_secs: u64,
    /// Poll interval while waiting on replica counts.
    pub verify_poll_secs: u64,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            health_gate_timeout_secs: 600,
            not_found_grace_secs: 60,
            not_found_retry_secs: 5,
            conflict_backoff_secs: 10,
            not_ready_retry_secs: 5,
            verify_poll_secs: 2,
        }
    }
}

impl EngineConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_secs(self.reconcile.timeout_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.reconcile.call_timeout_secs)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile.resync_interval_secs.max(1))
    }
}
