//! Strata Table Rebalancer
//!
//! This crate provides the incremental convergence engine that moves the
//! segment-to-server placement of a partitioned table from its current state
//! to a newly computed target while preserving query availability.
//!
//! The rebalancer:
//! - Resolves instance partitions and computes a target placement through a
//!   pluggable assignment policy
//! - Walks the authoritative ideal state toward the target in safe steps,
//!   each honoring a minimum-available-replicas floor and an optional
//!   per-server batch ceiling
//! - Waits for the reported external view to converge between steps and
//!   re-plans when the ideal state is mutated concurrently, using
//!   compare-and-set on the document version
//! - Optionally force-commits consuming (tail-of-stream) segments before
//!   moving them

pub mod assignment;
pub mod config;
pub mod convergence;
pub mod driver;
pub mod error;
pub mod force_commit;
pub mod model;
pub mod observer;
pub mod partitions;
pub mod planner;
pub mod result;
pub mod store;
pub mod summary;

// Re-export main types
pub use assignment::{PolicyError, SegmentAssignmentPolicy, StaticAssignment};
pub use config::{ConfigError, Enablement, RebalanceConfig, DISABLE_BATCH_SIZE_PER_SERVER};
pub use convergence::{is_converged, remaining_replicas, ConvergenceError, ConvergenceOptions};
pub use driver::TableRebalancer;
pub use error::RebalanceError;
pub use force_commit::{ForceCommitBatchConfig, ForceCommitError, RealtimeSegmentManager};
pub use model::{
    IdealState, InstanceConfig, InstanceId, InstanceStateMap, PlacementMap, SegmentId,
    SegmentState, TableConfig, TableType, Tier, Version,
};
pub use observer::{NoopObserver, RebalanceObserver, RebalanceProgress, Trigger};
pub use partitions::{
    DefaultInstanceAssigner, InstanceAssigner, InstancePartitions, PartitionCategory,
    PartitionsError, PartitionsResolver, ResolveOptions,
};
pub use planner::{next_assignment, PartitionIdFetcher, PlannerError, PlannerOptions};
pub use result::{RebalanceResult, RebalanceStatus};
pub use store::{MemoryPlacementStore, PlacementStore, StoreError};
pub use summary::{
    RebalanceSummary, SegmentMetadata, SegmentMetadataOracle, StreamMetadataOracle,
    TableSizeReader,
};
