//! Next-step planner
//!
//! Computes the next intermediate placement between the current and target
//! assignments while honoring the minimum-available-replicas floor and the
//! per-server batch ceiling. Two modes:
//! - Non-strict: segments move independently, in lexicographic order
//! - Strict replica-group: segments grouped by (current, target) instance
//!   pair and partition id move together to preserve co-location

use std::collections::{BTreeMap, BTreeSet, HashMap};

use thiserror::Error;
use tracing::warn;

use crate::config::DISABLE_BATCH_SIZE_PER_SERVER;
use crate::model::{InstanceId, InstanceStateMap, PlacementMap, SegmentId, SegmentState};

/// Planner errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlannerError {
    #[error("Failed to resolve partition id for segment: {0}")]
    MissingPartitionId(String),
}

pub type Result<T> = std::result::Result<T, PlannerError>;

/// Resolves the routing partition id of a segment.
pub trait PartitionIdFetcher {
    fn partition_id(&self, segment: &str) -> Result<u32>;
}

/// Stable fallback partition id derived from the segment name.
pub fn default_partition_id(segment: &str) -> u32 {
    let mut hash: u32 = 5381;
    for byte in segment.bytes() {
        hash = hash.wrapping_mul(33) ^ u32::from(byte);
    }
    hash
}

/// Options for one planning step.
#[derive(Debug, Clone, Copy)]
pub struct PlannerOptions {
    pub min_available_replicas: usize,
    pub strict_replica_group: bool,
    pub low_disk_mode: bool,
    /// Ceiling on segments newly added per server in this step, or
    /// [`DISABLE_BATCH_SIZE_PER_SERVER`].
    pub batch_size_per_server: i64,
}

type InstanceSet = BTreeSet<InstanceId>;
type AssignmentKey = (InstanceSet, InstanceSet);

/// Per-step planner state, created fresh for every step so nothing bleeds
/// across ideal state versions.
struct StepState {
    /// Per-instance count of segment replicas still to be offloaded; moves
    /// prefer instances with the fewest pending offloads.
    pending_offloads: HashMap<InstanceId, i64>,
    /// Chosen instance set per (current, target) instance pair, so co-routed
    /// segments land on the same mirror servers.
    assignments: HashMap<AssignmentKey, InstanceSet>,
    /// Intersection of available instances per chosen instance set, used by
    /// strict mode to keep the availability floor across admitted groups.
    available: HashMap<InstanceSet, InstanceSet>,
    /// Segments newly added per server so far in this step.
    added_per_server: HashMap<InstanceId, usize>,
}

impl StepState {
    fn new(current: &PlacementMap, target: &PlacementMap) -> Self {
        let mut pending_offloads: HashMap<InstanceId, i64> = HashMap::new();
        for instance_states in current.values() {
            for instance in instance_states.keys() {
                *pending_offloads.entry(instance.clone()).or_default() += 1;
            }
        }
        for instance_states in target.values() {
            for instance in instance_states.keys() {
                *pending_offloads.entry(instance.clone()).or_default() -= 1;
            }
        }
        Self {
            pending_offloads,
            assignments: HashMap::new(),
            available: HashMap::new(),
            added_per_server: HashMap::new(),
        }
    }

    fn record_move(&mut self, current_instances: &InstanceStateMap, next_instances: &InstanceSet) {
        for instance in current_instances.keys() {
            *self.pending_offloads.entry(instance.clone()).or_default() -= 1;
        }
        for instance in next_instances {
            *self.pending_offloads.entry(instance.clone()).or_default() += 1;
        }
    }
}

/// Assignment computed for a single segment.
struct SingleSegmentAssignment {
    instance_states: InstanceStateMap,
    /// Instances common to the current and next state of the segment.
    available: InstanceSet,
}

/// Computes the next placement between `current` and `target`.
///
/// `partition_ids` caches fetched partition ids across steps; everything else
/// about the computation is local to this call.
pub fn next_assignment(
    current: &PlacementMap,
    target: &PlacementMap,
    opts: &PlannerOptions,
    partition_ids: &mut HashMap<SegmentId, u32>,
    fetcher: &dyn PartitionIdFetcher,
) -> Result<PlacementMap> {
    if opts.strict_replica_group {
        next_strict_replica_group_assignment(current, target, opts, partition_ids, fetcher)
    } else {
        Ok(next_non_strict_assignment(current, target, opts))
    }
}

fn next_non_strict_assignment(
    current: &PlacementMap,
    target: &PlacementMap,
    opts: &PlannerOptions,
) -> PlacementMap {
    let mut state = StepState::new(current, target);
    let mut next = PlacementMap::new();

    for (segment, current_instances) in current {
        let Some(target_instances) = target.get(segment) else {
            next.insert(segment.clone(), current_instances.clone());
            continue;
        };
        let assignment =
            next_single_segment_assignment(current_instances, target_instances, opts, &mut state);
        let servers_added = servers_added(current_instances, &assignment.instance_states);

        let mut any_server_exhausted = false;
        if opts.batch_size_per_server != DISABLE_BATCH_SIZE_PER_SERVER {
            for server in &servers_added {
                if state.added_per_server.get(server).copied().unwrap_or(0)
                    >= opts.batch_size_per_server as usize
                {
                    any_server_exhausted = true;
                    break;
                }
            }
        }

        if any_server_exhausted {
            // At least one server is out of budget for this step; the segment
            // keeps its current placement.
            next.insert(segment.clone(), current_instances.clone());
        } else {
            for server in &servers_added {
                *state.added_per_server.entry(server.clone()).or_default() += 1;
            }
            let next_set: InstanceSet = assignment.instance_states.keys().cloned().collect();
            state.record_move(current_instances, &next_set);
            next.insert(segment.clone(), assignment.instance_states);
        }
    }
    next
}

fn next_strict_replica_group_assignment(
    current: &PlacementMap,
    target: &PlacementMap,
    opts: &PlannerOptions,
    partition_ids: &mut HashMap<SegmentId, u32>,
    fetcher: &dyn PartitionIdFetcher,
) -> Result<PlacementMap> {
    let mut state = StepState::new(current, target);
    let mut next = PlacementMap::new();

    if opts.batch_size_per_server == DISABLE_BATCH_SIZE_PER_SERVER {
        let all: Vec<(&SegmentId, &InstanceStateMap)> = current.iter().collect();
        assign_strict_group(&all, target, opts, &mut state, &mut next, false);
        return Ok(next);
    }

    // Group segments by (current instances, target instances) and further by
    // partition id; each group is admitted or deferred as a whole.
    let mut groups: BTreeMap<AssignmentKey, BTreeMap<u32, Vec<(&SegmentId, &InstanceStateMap)>>> =
        BTreeMap::new();
    for (segment, current_instances) in current {
        let Some(target_instances) = target.get(segment) else {
            next.insert(segment.clone(), current_instances.clone());
            continue;
        };
        let partition_id = match partition_ids.get(segment) {
            Some(id) => *id,
            None => {
                let id = fetcher.partition_id(segment)?;
                partition_ids.insert(segment.clone(), id);
                id
            }
        };
        let key: AssignmentKey = (
            current_instances.keys().cloned().collect(),
            target_instances.keys().cloned().collect(),
        );
        groups
            .entry(key)
            .or_default()
            .entry(partition_id)
            .or_default()
            .push((segment, current_instances));
    }

    for partition_groups in groups.values() {
        for group in partition_groups.values() {
            // Probe with the first segment; every segment in the group shares
            // the same (current, target) instance pair and partition id.
            let (first_segment, first_instances) = group[0];
            let first_assignment = next_single_segment_assignment(
                first_instances,
                &target[first_segment],
                opts,
                &mut state,
            );
            let probe_added = servers_added(first_instances, &first_assignment.instance_states);

            let batch_size = opts.batch_size_per_server as usize;
            let mut any_server_exhausted = false;
            for server in &probe_added {
                let added_so_far = state.added_per_server.get(server).copied().unwrap_or(0);
                // A server that already received segments this step must have
                // room for the whole group; a server at zero may exceed the
                // ceiling so a full partition can still make progress.
                if added_so_far >= batch_size
                    || (added_so_far > 0 && added_so_far + group.len() > batch_size)
                {
                    any_server_exhausted = true;
                    break;
                }
            }

            assign_strict_group(group, target, opts, &mut state, &mut next, any_server_exhausted);
        }
    }

    let max_added = state.added_per_server.values().copied().max().unwrap_or(0);
    if max_added > opts.batch_size_per_server as usize {
        warn!(
            max_added,
            batch_size_per_server = opts.batch_size_per_server,
            "A server exceeded the per-server batch ceiling; expected when a full \
             partition must move together under strict replica groups"
        );
    }
    Ok(next)
}

/// Assigns one strict group, either copying the current placement (budget
/// exhausted) or applying per-segment assignments while keeping the
/// available-instances intersection at or above the floor.
fn assign_strict_group(
    group: &[(&SegmentId, &InstanceStateMap)],
    target: &PlacementMap,
    opts: &PlannerOptions,
    state: &mut StepState,
    next: &mut PlacementMap,
    any_server_exhausted: bool,
) {
    if any_server_exhausted {
        for &(segment, current_instances) in group {
            next.insert(segment.clone(), current_instances.clone());
        }
        return;
    }

    for &(segment, current_instances) in group {
        let Some(target_instances) = target.get(segment) else {
            next.insert(segment.clone(), current_instances.clone());
            continue;
        };
        let assignment =
            next_single_segment_assignment(current_instances, target_instances, opts, state);
        let assigned: InstanceSet = assignment.instance_states.keys().cloned().collect();

        let chosen = match state.available.get(&assigned).cloned() {
            None => {
                // First segment routed to this instance set.
                state.available.insert(assigned.clone(), assignment.available);
                state.record_move(current_instances, &assigned);
                assignment.instance_states
            }
            Some(current_available) => {
                let intersection: InstanceSet =
                    assignment.available.intersection(&current_available).cloned().collect();
                if intersection.len() >= opts.min_available_replicas {
                    state.available.insert(assigned.clone(), intersection);
                    state.record_move(current_instances, &assigned);
                    assignment.instance_states
                } else {
                    // Admitting this segment would drop the shared availability
                    // below the floor; it keeps its current placement.
                    current_instances.clone()
                }
            }
        };

        if &chosen != current_instances {
            for server in servers_added(current_instances, &chosen) {
                *state.added_per_server.entry(server).or_default() += 1;
            }
        }
        next.insert(segment.clone(), chosen);
    }
}

fn next_single_segment_assignment(
    current_instances: &InstanceStateMap,
    target_instances: &InstanceStateMap,
    opts: &PlannerOptions,
    state: &mut StepState,
) -> SingleSegmentAssignment {
    let key: AssignmentKey = (
        current_instances.keys().cloned().collect(),
        target_instances.keys().cloned().collect(),
    );

    // Reuse the instance set already chosen for this (current, target) pair
    // so co-routed segments stay on the same mirror servers.
    if let Some(chosen) = state.assignments.get(&key) {
        let mut instance_states = InstanceStateMap::new();
        let mut available = InstanceSet::new();
        for instance in chosen {
            match (current_instances.get(instance), target_instances.get(instance)) {
                (Some(current_state), target_state) => {
                    available.insert(instance.clone());
                    instance_states
                        .insert(instance.clone(), *target_state.unwrap_or(current_state));
                }
                (None, Some(target_state)) => {
                    instance_states.insert(instance.clone(), *target_state);
                }
                (None, None) => {}
            }
        }
        return SingleSegmentAssignment { instance_states, available };
    }

    // Keep every instance common to current and target, at the target state.
    let mut instance_states = InstanceStateMap::new();
    for (instance, target_state) in target_instances {
        if current_instances.contains_key(instance) {
            instance_states.insert(instance.clone(), *target_state);
        }
    }

    // Retain current instances with the fewest pending offloads until the
    // availability floor is met (or current is exhausted).
    let to_keep = opts.min_available_replicas.saturating_sub(instance_states.len());
    if to_keep > 0 {
        for (instance, instance_state) in
            sorted_by_pending_offloads(current_instances, &instance_states, state).into_iter().take(to_keep)
        {
            instance_states.insert(instance, instance_state);
        }
    }
    let available: InstanceSet = instance_states.keys().cloned().collect();

    // In low disk mode new instances are only added once nothing remains to
    // drop, so drops and adds happen in separate steps.
    if !opts.low_disk_mode || current_instances.len() == instance_states.len() {
        let to_add = target_instances.len().saturating_sub(instance_states.len());
        for (instance, instance_state) in
            sorted_by_pending_offloads(target_instances, &instance_states, state).into_iter().take(to_add)
        {
            instance_states.insert(instance, instance_state);
        }
    }

    state.assignments.insert(key, instance_states.keys().cloned().collect());
    SingleSegmentAssignment { instance_states, available }
}

/// Candidates from `pool` not yet chosen, ordered by fewest pending offloads
/// with lexicographic tie-break for determinism.
fn sorted_by_pending_offloads(
    pool: &InstanceStateMap,
    chosen: &InstanceStateMap,
    state: &StepState,
) -> Vec<(InstanceId, SegmentState)> {
    let mut candidates: Vec<(InstanceId, SegmentState)> = pool
        .iter()
        .filter(|(instance, _)| !chosen.contains_key(*instance))
        .map(|(instance, instance_state)| (instance.clone(), *instance_state))
        .collect();
    candidates.sort_by(|a, b| {
        let offloads_a = state.pending_offloads.get(&a.0).copied().unwrap_or(0);
        let offloads_b = state.pending_offloads.get(&b.0).copied().unwrap_or(0);
        offloads_a.cmp(&offloads_b).then_with(|| a.0.cmp(&b.0))
    });
    candidates
}

fn servers_added(current_instances: &InstanceStateMap, next_instances: &InstanceStateMap) -> InstanceSet {
    next_instances
        .keys()
        .filter(|instance| !current_instances.contains_key(*instance))
        .cloned()
        .collect()
}
