//! Placement data model
//!
//! Core types shared across the rebalancer:
//! - Segment states and per-segment instance state maps
//! - The versioned ideal state document and the reported external view
//! - The slice of table metadata the rebalancer consumes

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque segment identifier, globally unique per table.
pub type SegmentId = String;

/// Opaque server instance identifier.
pub type InstanceId = String;

/// Monotonic version of the ideal state document.
pub type Version = u64;

/// State of one segment replica on one instance.
///
/// In the ideal state `Offline` means "do not serve"; in the external view it
/// means "not loaded". `Error` is terminal for a (segment, instance) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SegmentState {
    Online,
    Consuming,
    Offline,
    Error,
    Dropped,
}

impl fmt::Display for SegmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Online => write!(f, "ONLINE"),
            Self::Consuming => write!(f, "CONSUMING"),
            Self::Offline => write!(f, "OFFLINE"),
            Self::Error => write!(f, "ERROR"),
            Self::Dropped => write!(f, "DROPPED"),
        }
    }
}

/// Mapping from instance to the state of one segment on that instance.
pub type InstanceStateMap = BTreeMap<InstanceId, SegmentState>;

/// Mapping from segment to its instance state map.
///
/// `BTreeMap` keeps iteration lexicographic on segment id, which the planner
/// relies on for deterministic step computation.
pub type PlacementMap = BTreeMap<SegmentId, InstanceStateMap>;

/// The authoritative desired placement for a table.
///
/// Stored in the placement store together with a monotonic version; all
/// updates are compare-and-set on that version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdealState {
    pub segments: PlacementMap,
    pub replicas: usize,
    pub num_partitions: usize,
    pub enabled: bool,
}

impl IdealState {
    pub fn new(segments: PlacementMap, replicas: usize) -> Self {
        let num_partitions = segments.len();
        Self { segments, replicas, num_partitions, enabled: true }
    }

    /// Replaces the placement and refreshes the derived replica/partition
    /// counts from the new map.
    pub fn apply_placement(&mut self, segments: PlacementMap) {
        self.replicas = segments.values().next().map_or(self.replicas, BTreeMap::len);
        self.num_partitions = segments.len();
        self.segments = segments;
    }
}

/// Whether a table serves immutable segments only or also consumes a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TableType {
    Offline,
    Realtime,
}

/// A storage tier, already ordered by the caller from hottest to coldest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tier {
    pub name: String,
    pub server_tag: String,
}

/// The slice of table metadata the rebalancer consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableConfig {
    pub name: String,
    pub table_type: TableType,
    /// Configured replica count per segment.
    pub replication: usize,
    /// Server tag that instances must carry to host this table.
    pub server_tag: String,
    /// Whether committed (COMPLETED) segments relocate to their own servers.
    pub relocate_completed_segments: bool,
    /// Strict replica-group routing: all segments of a partition must be
    /// served by the same instance set.
    pub strict_replica_group_routing: bool,
    pub tiers: Vec<Tier>,
}

impl TableConfig {
    pub fn new(name: impl Into<String>, table_type: TableType, replication: usize) -> Self {
        Self {
            name: name.into(),
            table_type,
            replication,
            server_tag: String::new(),
            relocate_completed_segments: false,
            strict_replica_group_routing: false,
            tiers: Vec::new(),
        }
    }
}

/// Per-instance configuration read from the placement store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub instance: InstanceId,
    pub tags: Vec<String>,
    pub enabled: bool,
}

/// Segments whose instance state map differs between the two placements.
pub fn segments_to_move(current: &PlacementMap, target: &PlacementMap) -> BTreeSet<SegmentId> {
    current
        .iter()
        .filter(|&(segment, instance_states)| target.get(segment) != Some(instance_states))
        .map(|(segment, _)| segment.clone())
        .collect()
}

/// True if the instance state map is a consuming placement: at least one
/// CONSUMING replica and no ONLINE replica.
pub fn is_consuming_placement(instance_states: &InstanceStateMap) -> bool {
    let mut any_consuming = false;
    for state in instance_states.values() {
        match state {
            SegmentState::Online => return false,
            SegmentState::Consuming => any_consuming = true,
            _ => {}
        }
    }
    any_consuming
}

/// Consuming segments whose instance set changes between the two placements.
/// Moving these generally requires committing them first.
pub fn moving_consuming_segments(
    current: &PlacementMap,
    target: &PlacementMap,
) -> BTreeSet<SegmentId> {
    let mut moving = BTreeSet::new();
    for (segment, current_states) in current {
        let Some(target_states) = target.get(segment) else { continue };
        if !is_consuming_placement(target_states) {
            continue;
        }
        let current_instances: BTreeSet<_> = current_states.keys().collect();
        let target_instances: BTreeSet<_> = target_states.keys().collect();
        if current_instances != target_instances {
            moving.insert(segment.clone());
        }
    }
    moving
}

/// Per-instance (added, removed) segment counts between two placements, for
/// step logging.
pub fn segments_moved_per_instance(
    current: &PlacementMap,
    next: &PlacementMap,
) -> BTreeMap<InstanceId, (usize, usize)> {
    let mut moves: BTreeMap<InstanceId, (usize, usize)> = BTreeMap::new();
    for (segment, next_states) in next {
        let current_instances: BTreeSet<&InstanceId> =
            current.get(segment).map(|m| m.keys().collect()).unwrap_or_default();
        for instance in next_states.keys() {
            if !current_instances.contains(instance) {
                moves.entry(instance.clone()).or_default().0 += 1;
            }
        }
    }
    for (segment, current_states) in current {
        let next_instances: BTreeSet<&InstanceId> =
            next.get(segment).map(|m| m.keys().collect()).unwrap_or_default();
        for instance in current_states.keys() {
            if !next_instances.contains(instance) {
                moves.entry(instance.clone()).or_default().1 += 1;
            }
        }
    }
    moves
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;

    /// Builds an instance state map from (instance, state) pairs.
    pub fn states(entries: &[(&str, SegmentState)]) -> InstanceStateMap {
        entries.iter().map(|(i, s)| (i.to_string(), *s)).collect()
    }

    /// Builds an all-ONLINE instance state map.
    pub fn online(instances: &[&str]) -> InstanceStateMap {
        instances.iter().map(|i| (i.to_string(), SegmentState::Online)).collect()
    }

    /// Builds an all-CONSUMING instance state map.
    pub fn consuming(instances: &[&str]) -> InstanceStateMap {
        instances.iter().map(|i| (i.to_string(), SegmentState::Consuming)).collect()
    }

    /// Builds a placement map from (segment, instance state map) pairs.
    pub fn placement(entries: &[(&str, InstanceStateMap)]) -> PlacementMap {
        entries.iter().map(|(s, m)| (s.to_string(), m.clone())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::test_util::*;
    use super::*;

    #[test]
    fn test_segment_state_serde() {
        let json = serde_json::to_string(&SegmentState::Consuming).unwrap();
        assert_eq!(json, "\"CONSUMING\"");
        let state: SegmentState = serde_json::from_str("\"ONLINE\"").unwrap();
        assert_eq!(state, SegmentState::Online);
    }

    #[test]
    fn test_segments_to_move() {
        let current = placement(&[
            ("s1", online(&["i1", "i2"])),
            ("s2", online(&["i1", "i2"])),
        ]);
        let mut target = current.clone();
        target.insert("s2".to_string(), online(&["i2", "i3"]));

        let to_move = segments_to_move(&current, &target);
        assert_eq!(to_move.into_iter().collect::<Vec<_>>(), vec!["s2"]);
    }

    #[test]
    fn test_segments_to_move_state_change_counts() {
        // Same instances but a state change still counts as a move.
        let current = placement(&[("s1", consuming(&["i1", "i2"]))]);
        let target = placement(&[("s1", online(&["i1", "i2"]))]);
        assert_eq!(segments_to_move(&current, &target).len(), 1);
    }

    #[test]
    fn test_moving_consuming_segments() {
        let current = placement(&[
            ("done", online(&["i1", "i2"])),
            ("tail", consuming(&["i1", "i2"])),
        ]);
        let target = placement(&[
            ("done", online(&["i3", "i4"])),
            ("tail", consuming(&["i3", "i4"])),
        ]);
        let moving = moving_consuming_segments(&current, &target);
        assert_eq!(moving.into_iter().collect::<Vec<_>>(), vec!["tail"]);
    }

    #[test]
    fn test_moving_consuming_ignores_unmoved() {
        let current = placement(&[("tail", consuming(&["i1", "i2"]))]);
        let target = current.clone();
        assert!(moving_consuming_segments(&current, &target).is_empty());
    }

    #[test]
    fn test_is_consuming_placement() {
        assert!(is_consuming_placement(&consuming(&["i1"])));
        assert!(!is_consuming_placement(&online(&["i1"])));
        assert!(!is_consuming_placement(&states(&[
            ("i1", SegmentState::Online),
            ("i2", SegmentState::Consuming),
        ])));
        assert!(!is_consuming_placement(&states(&[("i1", SegmentState::Offline)])));
    }

    #[test]
    fn test_segments_moved_per_instance() {
        let current = placement(&[("s1", online(&["i1", "i2"]))]);
        let next = placement(&[("s1", online(&["i2", "i3"]))]);
        let moves = segments_moved_per_instance(&current, &next);
        assert_eq!(moves.get("i3"), Some(&(1, 0)));
        assert_eq!(moves.get("i1"), Some(&(0, 1)));
        assert_eq!(moves.get("i2"), None);
    }

    #[test]
    fn test_apply_placement_refreshes_counts() {
        let mut ideal = IdealState::new(placement(&[("s1", online(&["i1", "i2"]))]), 2);
        ideal.apply_placement(placement(&[
            ("s1", online(&["i1", "i2", "i3"])),
            ("s2", online(&["i1", "i2", "i3"])),
        ]));
        assert_eq!(ideal.replicas, 3);
        assert_eq!(ideal.num_partitions, 2);
    }
}
