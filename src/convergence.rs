//! External view convergence predicate
//!
//! Pure comparison of the reported external view against the ideal state,
//! counting segment replicas that have not yet reached their target state.

use std::collections::BTreeSet;

use thiserror::Error;
use tracing::warn;

use crate::model::{PlacementMap, SegmentId, SegmentState};

/// Convergence errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConvergenceError {
    #[error("Segment {segment} on instance {instance} is in ERROR state")]
    StuckInError { segment: String, instance: String },
}

pub type Result<T> = std::result::Result<T, ConvergenceError>;

/// Options for one convergence check.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConvergenceOptions<'a> {
    /// Count extra external-view replicas that must be dropped before new
    /// ones are added.
    pub low_disk_mode: bool,
    /// Treat ERROR replicas as converged instead of failing.
    pub best_effort: bool,
    /// Restrict the check to these segments; `None` checks every segment in
    /// the ideal state.
    pub monitored: Option<&'a BTreeSet<SegmentId>>,
}

/// Counts the segment replicas that are not yet in their ideal state.
///
/// Only segments present in the ideal state (and monitored, if a monitored
/// set is given) are considered; extra external-view segments are not managed
/// by the rebalancer. For each ideal (instance, state) pair with a
/// non-OFFLINE state, one replica is counted when the segment or instance is
/// missing from the external view or reports a different state. An ERROR
/// report fails the check unless `best_effort` is set.
///
/// With `early_return`, stops at the first remaining replica and returns 1.
pub fn remaining_replicas(
    external_view: &PlacementMap,
    ideal_state: &PlacementMap,
    opts: ConvergenceOptions<'_>,
    early_return: bool,
) -> Result<usize> {
    let mut remaining = 0;

    for (segment, ideal_instance_states) in ideal_state {
        if let Some(monitored) = opts.monitored {
            if !monitored.contains(segment) {
                continue;
            }
        }
        let view_instance_states = external_view.get(segment);

        for (instance, ideal_instance_state) in ideal_instance_states {
            // OFFLINE in the ideal state means "do not serve"; nothing to
            // wait for.
            if *ideal_instance_state == SegmentState::Offline {
                continue;
            }

            let Some(view_instance_states) = view_instance_states else {
                // The segment has not shown up in the external view yet.
                remaining += 1;
                if early_return {
                    return Ok(remaining);
                }
                continue;
            };

            let view_state = view_instance_states.get(instance);
            if view_state != Some(ideal_instance_state) {
                if view_state == Some(&SegmentState::Error) {
                    check_error_replica(segment, instance, opts.best_effort)?;
                } else {
                    remaining += 1;
                    if early_return {
                        return Ok(remaining);
                    }
                }
            }
        }

        // In low disk mode, replicas that should be dropped but still show up
        // in the external view also count as pending work.
        if opts.low_disk_mode {
            if let Some(view_instance_states) = view_instance_states {
                for (instance, view_state) in view_instance_states {
                    if ideal_instance_states.contains_key(instance) {
                        continue;
                    }
                    if *view_state == SegmentState::Error {
                        check_error_replica(segment, instance, opts.best_effort)?;
                    } else {
                        remaining += 1;
                        if early_return {
                            return Ok(remaining);
                        }
                    }
                }
            }
        }
    }

    Ok(remaining)
}

/// True once no monitored replica remains out of its ideal state.
pub fn is_converged(
    external_view: &PlacementMap,
    ideal_state: &PlacementMap,
    opts: ConvergenceOptions<'_>,
) -> Result<bool> {
    Ok(remaining_replicas(external_view, ideal_state, opts, true)? == 0)
}

fn check_error_replica(segment: &str, instance: &str, best_effort: bool) -> Result<()> {
    if best_effort {
        warn!(segment, instance, "Replica in ERROR state, counting as converged (best-effort)");
        Ok(())
    } else {
        warn!(segment, instance, "Replica in ERROR state");
        Err(ConvergenceError::StuckInError {
            segment: segment.to_string(),
            instance: instance.to_string(),
        })
    }
}
