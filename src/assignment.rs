//! Segment assignment policy seam
//!
//! The rebalancer treats target placement computation as a pluggable
//! capability: given the current placement and the resolved instance
//! partitions, a policy produces the target placement. Policy internals live
//! with the host system; the driver only needs this surface.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::config::RebalanceConfig;
use crate::model::{PlacementMap, Tier};
use crate::partitions::{InstancePartitions, PartitionCategory};

/// Policy errors
#[derive(Error, Debug, Clone)]
pub enum PolicyError {
    #[error("Invalid assignment config: {0}")]
    InvalidConfig(String),

    #[error("Assignment failed: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, PolicyError>;

/// Computes a target placement from the current placement and instance
/// partitions.
///
/// Implementations must be deterministic for identical inputs, total over the
/// segments of the current placement, and produce the configured replica
/// count per segment.
pub trait SegmentAssignmentPolicy: Send + Sync {
    fn rebalance(
        &self,
        current: &PlacementMap,
        partitions: &BTreeMap<PartitionCategory, InstancePartitions>,
        sorted_tiers: &[Tier],
        tier_partitions: &BTreeMap<String, InstancePartitions>,
        config: &RebalanceConfig,
    ) -> Result<PlacementMap>;

    /// Strict-realtime policies assign new segments relative to the existing
    /// placement, so any concurrent ideal state change forces a full re-plan.
    fn is_strict_realtime(&self) -> bool {
        false
    }
}

/// Policy that returns a pre-computed target placement.
///
/// Segments missing from the stored target keep their current placement, so
/// re-planning against an ideal state that grew concurrently stays total.
/// Used by embedders driving the engine with an externally computed target,
/// and throughout the test suite.
pub struct StaticAssignment {
    target: PlacementMap,
    strict_realtime: bool,
}

impl StaticAssignment {
    pub fn new(target: PlacementMap) -> Self {
        Self { target, strict_realtime: false }
    }

    pub fn strict_realtime(target: PlacementMap) -> Self {
        Self { target, strict_realtime: true }
    }
}

impl SegmentAssignmentPolicy for StaticAssignment {
    fn rebalance(
        &self,
        current: &PlacementMap,
        _partitions: &BTreeMap<PartitionCategory, InstancePartitions>,
        _sorted_tiers: &[Tier],
        _tier_partitions: &BTreeMap<String, InstancePartitions>,
        _config: &RebalanceConfig,
    ) -> Result<PlacementMap> {
        Ok(current
            .iter()
            .map(|(segment, instance_states)| {
                let target_states =
                    self.target.get(segment).unwrap_or(instance_states).clone();
                (segment.clone(), target_states)
            })
            .collect())
    }

    fn is_strict_realtime(&self) -> bool {
        self.strict_realtime
    }
}
