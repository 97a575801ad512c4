//! Observer interface
//!
//! Callbacks into the host process for progress tracking, error reporting,
//! and cooperative stop. Every method has a default no-op implementation so
//! the driver stays total without a caller-supplied observer.

use std::collections::BTreeSet;

use crate::model::{PlacementMap, SegmentId};
use crate::result::RebalanceStatus;

/// The checkpoints at which the driver reports progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Rebalance entered the no-downtime loop.
    Start,
    /// One external-view convergence check completed.
    EvToIsConvergence,
    /// The ideal state changed (concurrently or through our own write) and a
    /// new target is in effect.
    IdealStateChange,
    /// The next intermediate placement was computed.
    NextAssignmentCalculation,
    ForceCommitStart,
    ForceCommitEnd,
}

/// Progress context handed to [`RebalanceObserver::on_trigger`].
#[derive(Debug, Clone, Default)]
pub struct RebalanceProgress {
    /// Estimated average segment size, or -1 when no size oracle is available.
    pub estimated_segment_size_bytes: i64,
    /// All segments in the ideal state at the time of the trigger.
    pub all_segments: BTreeSet<SegmentId>,
    /// Segments whose convergence the current step is waiting on.
    pub segments_to_monitor: Option<BTreeSet<SegmentId>>,
    pub segments_force_committed: usize,
}

/// Callbacks for a rebalance run.
///
/// `is_stopped` is consulted at every checkpoint before an ideal state write;
/// once it returns true the driver finishes without writing and returns
/// [`RebalanceObserver::stop_status`]. Cancellation is cooperative only.
pub trait RebalanceObserver: Send + Sync {
    fn on_trigger(
        &self,
        trigger: Trigger,
        current: Option<&PlacementMap>,
        target: Option<&PlacementMap>,
        progress: &RebalanceProgress,
    ) {
        let _ = (trigger, current, target, progress);
    }

    fn on_noop(&self, message: &str) {
        let _ = message;
    }

    fn on_success(&self, message: &str) {
        let _ = message;
    }

    fn on_error(&self, message: &str) {
        let _ = message;
    }

    /// A compare-and-set write lost the race; the step will be re-planned.
    fn on_rollback(&self) {}

    fn is_stopped(&self) -> bool {
        false
    }

    fn stop_status(&self) -> RebalanceStatus {
        RebalanceStatus::Cancelled
    }
}

/// Default observer: ignores everything, never stops.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl RebalanceObserver for NoopObserver {}
