//! Rebalance result envelope

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::PlacementMap;
use crate::partitions::{InstancePartitions, PartitionCategory};
use crate::summary::RebalanceSummary;

/// Terminal status of a rebalance run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RebalanceStatus {
    /// Nothing to do: placement and instance partitions already match.
    NoOp,
    Done,
    Failed,
    /// Stopped by the observer because the run can no longer proceed.
    Aborted,
    /// Stopped by the observer on user request.
    Cancelled,
}

impl fmt::Display for RebalanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoOp => write!(f, "NO_OP"),
            Self::Done => write!(f, "DONE"),
            Self::Failed => write!(f, "FAILED"),
            Self::Aborted => write!(f, "ABORTED"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// Outcome of one rebalance run, including snapshots of whatever was computed
/// before the run terminated.
#[derive(Debug, Clone)]
pub struct RebalanceResult {
    pub job_id: String,
    pub status: RebalanceStatus,
    pub description: String,
    pub instance_partitions: Option<BTreeMap<PartitionCategory, InstancePartitions>>,
    pub tier_instance_partitions: Option<BTreeMap<String, InstancePartitions>>,
    pub target_placement: Option<PlacementMap>,
    pub summary: Option<RebalanceSummary>,
}

impl RebalanceResult {
    pub fn new(job_id: impl Into<String>, status: RebalanceStatus, description: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            status,
            description: description.into(),
            instance_partitions: None,
            tier_instance_partitions: None,
            target_placement: None,
            summary: None,
        }
    }

    pub fn is_terminal_success(&self) -> bool {
        matches!(self.status, RebalanceStatus::NoOp | RebalanceStatus::Done)
    }
}
