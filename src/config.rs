//! Rebalance run configuration
//!
//! All knobs recognized by the rebalance driver, with validation of the
//! combinations that must be rejected before any side effect.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Sentinel disabling the per-server batch ceiling.
pub const DISABLE_BATCH_SIZE_PER_SERVER: i64 = -1;

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("batch_size_per_server must be >= 1 or -1 to disable, got {0}")]
    InvalidBatchSize(i64),

    #[error("pre-checks can only be enabled in dry-run mode")]
    PreChecksWithoutDryRun,
}

/// Tri-state enablement used where a flag must distinguish "not set" from an
/// explicit choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Enablement {
    #[default]
    Default,
    Enable,
    Disable,
}

/// Configuration for a single rebalance run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalanceConfig {
    /// Plan only: compute the target and summary without touching the cluster.
    pub dry_run: bool,
    /// Run pre-checks; requires `dry_run`.
    pub pre_checks: bool,
    /// Recompute instance partitions from the current instance configs.
    pub reassign_instances: bool,
    /// Include tail (consuming) segments in movement.
    pub include_consuming: bool,
    /// Ignore previously persisted instance partitions when reassigning.
    pub bootstrap: bool,
    /// Replace the ideal state with the target in a single step, with no
    /// availability guarantee.
    pub downtime: bool,
    /// Minimum replicas that must stay up for every moving segment. Negative
    /// values mean max-unavailable: `replicas + value`, floored at 0.
    pub min_available_replicas: i64,
    /// Drop replicas before adding new ones to bound peak disk usage.
    pub low_disk_mode: bool,
    /// Tolerate ERROR replicas and stalled convergence instead of failing.
    pub best_effort: bool,
    /// Ceiling on segments newly added per server in one step, or
    /// [`DISABLE_BATCH_SIZE_PER_SERVER`].
    pub batch_size_per_server: i64,
    pub external_view_check_interval_ms: u64,
    pub external_view_stabilization_timeout_ms: u64,
    pub minimize_data_movement: Enablement,
    /// Commit tail segments before moving them.
    pub force_commit: bool,
    pub force_commit_batch_size: usize,
    pub force_commit_batch_status_check_interval_ms: u64,
    pub force_commit_batch_status_check_timeout_ms: u64,
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            pre_checks: false,
            reassign_instances: false,
            include_consuming: true,
            bootstrap: false,
            downtime: false,
            min_available_replicas: 1,
            low_disk_mode: false,
            best_effort: false,
            batch_size_per_server: DISABLE_BATCH_SIZE_PER_SERVER,
            external_view_check_interval_ms: 1_000,
            external_view_stabilization_timeout_ms: 3_600_000,
            minimize_data_movement: Enablement::Default,
            force_commit: false,
            force_commit_batch_size: usize::MAX,
            force_commit_batch_status_check_interval_ms: 5_000,
            force_commit_batch_status_check_timeout_ms: 180_000,
        }
    }
}

impl RebalanceConfig {
    /// Rejects invalid knob combinations. Called before any side effect.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size_per_server == 0 || self.batch_size_per_server < DISABLE_BATCH_SIZE_PER_SERVER
        {
            return Err(ConfigError::InvalidBatchSize(self.batch_size_per_server));
        }
        if self.pre_checks && !self.dry_run {
            return Err(ConfigError::PreChecksWithoutDryRun);
        }
        Ok(())
    }

    pub fn external_view_check_interval(&self) -> Duration {
        Duration::from_millis(self.external_view_check_interval_ms)
    }

    pub fn external_view_stabilization_timeout(&self) -> Duration {
        Duration::from_millis(self.external_view_stabilization_timeout_ms)
    }

    pub fn batching_enabled(&self) -> bool {
        self.batch_size_per_server != DISABLE_BATCH_SIZE_PER_SERVER
    }
}

/// Resolves the configured `min_available_replicas` against the target
/// replica count: non-negative values are used as-is (and must be smaller
/// than the replica count), negative values count max-unavailable replicas.
pub fn resolve_min_available_replicas(
    configured: i64,
    target_replicas: usize,
) -> Option<usize> {
    if configured >= 0 {
        if configured as usize >= target_replicas {
            return None;
        }
        Some(configured as usize)
    } else {
        Some(target_replicas.saturating_sub(configured.unsigned_abs() as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        assert!(RebalanceConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let config = RebalanceConfig { batch_size_per_server: 0, ..Default::default() };
        assert_eq!(config.validate(), Err(ConfigError::InvalidBatchSize(0)));

        let config = RebalanceConfig { batch_size_per_server: -2, ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_pre_checks_require_dry_run() {
        let config = RebalanceConfig { pre_checks: true, ..Default::default() };
        assert_eq!(config.validate(), Err(ConfigError::PreChecksWithoutDryRun));

        let config =
            RebalanceConfig { pre_checks: true, dry_run: true, ..Default::default() };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_resolve_min_available_replicas() {
        // Non-negative: used directly, must stay below the replica count.
        assert_eq!(resolve_min_available_replicas(1, 3), Some(1));
        assert_eq!(resolve_min_available_replicas(0, 3), Some(0));
        assert_eq!(resolve_min_available_replicas(3, 3), None);
        assert_eq!(resolve_min_available_replicas(5, 3), None);

        // Negative: max-unavailable, floored at zero.
        assert_eq!(resolve_min_available_replicas(-1, 3), Some(2));
        assert_eq!(resolve_min_available_replicas(-3, 3), Some(0));
        assert_eq!(resolve_min_available_replicas(-5, 3), Some(0));
    }

    #[test]
    fn test_batching_enabled() {
        assert!(!RebalanceConfig::default().batching_enabled());
        let config = RebalanceConfig { batch_size_per_server: 4, ..Default::default() };
        assert!(config.batching_enabled());
    }
}
