//! Rebalance error kinds
//!
//! Unified error surface for a rebalance run. `VersionMismatch` from the
//! store is the only locally recovered failure; everything else terminates
//! the run.

use std::time::Duration;

use thiserror::Error;

use crate::assignment::PolicyError;
use crate::config::ConfigError;
use crate::convergence::ConvergenceError;
use crate::force_commit::ForceCommitError;
use crate::partitions::PartitionsError;
use crate::planner::PlannerError;
use crate::store::StoreError;

/// Errors terminating a rebalance run.
#[derive(Error, Debug)]
pub enum RebalanceError {
    #[error("Cannot rebalance disabled table without downtime: {0}")]
    DisabledTable(String),

    #[error("Invalid rebalance config: {0}")]
    InvalidConfig(String),

    #[error("External view made no progress within {timeout:?} ({extensions} extensions granted)")]
    ConvergenceTimeout { timeout: Duration, extensions: u32 },

    #[error(transparent)]
    Convergence(#[from] ConvergenceError),

    #[error(transparent)]
    ForceCommit(#[from] ForceCommitError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Partitions(#[from] PartitionsError),

    #[error("Assignment policy failed: {0}")]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Planner(#[from] PlannerError),
}

impl From<ConfigError> for RebalanceError {
    fn from(err: ConfigError) -> Self {
        Self::InvalidConfig(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RebalanceError>;
