//! Rebalance summary calculator
//!
//! Produces an advisory description of the movement between the current and
//! target placements: per-server and per-tag segment deltas, replication
//! factor changes, estimated data movement, and consuming segment lag.
//! Null-tolerant: a failing oracle degrades the affected figures to `-1`
//! sentinels and never fails the rebalance.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::model::{
    is_consuming_placement, InstanceId, PlacementMap, SegmentId, TableConfig, TableType,
};

/// How many consuming segments the age/lag leaderboards keep.
pub const TOP_N_CONSUMING_SEGMENT_SUMMARY: usize = 10;

/// Tag bucket for servers that hold segments but carry none of the table's
/// relevant tags (possible when tags changed without instance reassignment).
pub const TAG_FOR_OUTDATED_SERVERS: &str = "OUTDATED_SERVERS";

/// Oracle reading the reported per-replica table size.
#[async_trait::async_trait]
pub trait TableSizeReader: Send + Sync {
    async fn table_size_per_replica_bytes(
        &self,
        table: &str,
        timeout: Duration,
    ) -> std::result::Result<u64, Box<dyn std::error::Error + Send + Sync>>;
}

/// Per-segment metadata read from the cluster metadata store.
#[derive(Debug, Clone, Default)]
pub struct SegmentMetadata {
    pub creation_time_ms: i64,
    pub start_offset: Option<i64>,
    pub partition_id: Option<u32>,
}

#[async_trait::async_trait]
pub trait SegmentMetadataOracle: Send + Sync {
    async fn segment_metadata(
        &self,
        table: &str,
        segment: &str,
    ) -> std::result::Result<SegmentMetadata, Box<dyn std::error::Error + Send + Sync>>;
}

/// Oracle reading the largest offset of one stream partition.
#[async_trait::async_trait]
pub trait StreamMetadataOracle: Send + Sync {
    async fn fetch_largest_offset(
        &self,
        table: &str,
        partition_id: u32,
        timeout: Duration,
    ) -> std::result::Result<i64, Box<dyn std::error::Error + Send + Sync>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeInfo {
    pub before: usize,
    pub after: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerStatus {
    Added,
    Removed,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSegmentChange {
    pub status: ServerStatus,
    pub segments_before: usize,
    pub segments_after: usize,
    pub segments_added: usize,
    pub segments_deleted: usize,
    pub segments_unchanged: usize,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub num_servers: ChangeInfo,
    pub servers_added: BTreeSet<InstanceId>,
    pub servers_removed: BTreeSet<InstanceId>,
    pub servers_unchanged: BTreeSet<InstanceId>,
    pub servers_getting_new_segments: BTreeSet<InstanceId>,
    pub server_segment_changes: BTreeMap<InstanceId, ServerSegmentChange>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagInfo {
    pub num_segments_unchanged: usize,
    pub num_segments_to_download: usize,
    pub num_server_participants: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumingPerServer {
    pub num_consuming_segments_added: usize,
    /// Total offsets the server must catch up, or -1 when lag is unknown.
    pub total_offsets_to_catch_up: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumingSegmentSummary {
    pub num_consuming_segments_to_move: usize,
    pub num_servers_getting_consuming_segments: usize,
    /// Top segments by offsets to catch up, descending; `None` when the
    /// stream or metadata oracle could not answer.
    pub top_offsets_to_catch_up: Option<Vec<(SegmentId, i64)>>,
    /// Top segments by age in minutes, descending; `None` when metadata was
    /// incomplete.
    pub oldest_segments_minutes: Option<Vec<(SegmentId, i64)>>,
    pub per_server: BTreeMap<InstanceId, ConsumingPerServer>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentInfo {
    pub total_segments_to_be_moved: usize,
    pub total_segments_to_be_deleted: usize,
    pub max_segments_added_to_single_server: usize,
    /// -1 when no size oracle answered.
    pub estimated_average_segment_size_bytes: i64,
    /// -1 when no size oracle answered.
    pub total_estimated_data_to_move_bytes: i64,
    pub replication_factor: ChangeInfo,
    pub num_segments_in_single_replica: ChangeInfo,
    pub num_segments_across_all_replicas: ChangeInfo,
    pub consuming: Option<ConsumingSegmentSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebalanceSummary {
    pub server_info: ServerInfo,
    pub segment_info: SegmentInfo,
    pub tags_info: BTreeMap<String, TagInfo>,
}

/// Oracles and tag context available to the calculator; all optional.
#[derive(Default)]
pub struct SummaryContext<'a> {
    pub size_reader: Option<&'a dyn TableSizeReader>,
    pub segment_metadata: Option<&'a dyn SegmentMetadataOracle>,
    pub stream_metadata: Option<&'a dyn StreamMetadataOracle>,
    pub instance_tags: BTreeMap<InstanceId, Vec<String>>,
    pub size_read_timeout: Duration,
    pub offset_read_timeout: Duration,
}

fn server_to_segments(placement: &PlacementMap) -> BTreeMap<InstanceId, BTreeSet<SegmentId>> {
    let mut by_server: BTreeMap<InstanceId, BTreeSet<SegmentId>> = BTreeMap::new();
    for (segment, instance_states) in placement {
        for instance in instance_states.keys() {
            by_server.entry(instance.clone()).or_default().insert(segment.clone());
        }
    }
    by_server
}

fn server_to_consuming_segments(
    placement: &PlacementMap,
) -> BTreeMap<InstanceId, BTreeSet<SegmentId>> {
    let mut by_server: BTreeMap<InstanceId, BTreeSet<SegmentId>> = BTreeMap::new();
    for (segment, instance_states) in placement {
        if !is_consuming_placement(instance_states) {
            continue;
        }
        for instance in instance_states.keys() {
            by_server.entry(instance.clone()).or_default().insert(segment.clone());
        }
    }
    by_server
}

fn top_n_descending(values: &BTreeMap<SegmentId, i64>, n: usize) -> Vec<(SegmentId, i64)> {
    let mut entries: Vec<(SegmentId, i64)> =
        values.iter().map(|(segment, value)| (segment.clone(), *value)).collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    entries.truncate(n);
    entries
}

/// Computes the movement summary between the current and target placements.
pub async fn calculate_summary(
    table: &TableConfig,
    current: &PlacementMap,
    target: &PlacementMap,
    ctx: &SummaryContext<'_>,
) -> RebalanceSummary {
    let existing_by_server = server_to_segments(current);
    let new_by_server = server_to_segments(target);

    let existing_replication = current.values().next().map_or(0, BTreeMap::len);
    let new_replication = target.values().next().map_or(0, BTreeMap::len);

    let relevant_tags: BTreeSet<String> = std::iter::once(table.server_tag.clone())
        .chain(table.tiers.iter().map(|tier| tier.server_tag.clone()))
        .filter(|tag| !tag.is_empty())
        .collect();
    let mut tags_info: BTreeMap<String, TagInfo> =
        relevant_tags.iter().map(|tag| (tag.clone(), TagInfo::default())).collect();

    let mut servers_added = BTreeSet::new();
    let mut servers_removed = BTreeSet::new();
    let mut servers_unchanged = BTreeSet::new();
    let mut servers_getting_new_segments = BTreeSet::new();
    let mut server_segment_changes = BTreeMap::new();

    let mut segments_not_moved = 0;
    let mut total_segments_to_be_deleted = 0;
    let mut max_segments_added_to_single_server = 0;

    for (server, new_segments) in &new_by_server {
        let empty = BTreeSet::new();
        let existing_segments = existing_by_server.get(server).unwrap_or(&empty);
        let status = if existing_by_server.contains_key(server) {
            servers_unchanged.insert(server.clone());
            ServerStatus::Unchanged
        } else {
            servers_added.insert(server.clone());
            ServerStatus::Added
        };

        let unchanged = new_segments.intersection(existing_segments).count();
        let added = new_segments.len() - unchanged;
        let deleted = existing_segments.len() - unchanged;
        segments_not_moved += unchanged;
        total_segments_to_be_deleted += deleted;
        max_segments_added_to_single_server = max_segments_added_to_single_server.max(added);
        if added > 0 {
            servers_getting_new_segments.insert(server.clone());
        }

        let tags = ctx.instance_tags.get(server).cloned().unwrap_or_default();
        let server_relevant_tags: Vec<&String> =
            tags.iter().filter(|tag| relevant_tags.contains(*tag)).collect();
        if server_relevant_tags.is_empty() {
            warn!(server = %server, "Server was assigned segments but carries no relevant tag");
            let info = tags_info.entry(TAG_FOR_OUTDATED_SERVERS.to_string()).or_default();
            info.num_segments_unchanged += unchanged;
            info.num_segments_to_download += added;
            info.num_server_participants += 1;
        } else {
            for tag in server_relevant_tags {
                let info = tags_info.entry(tag.clone()).or_default();
                info.num_segments_unchanged += unchanged;
                info.num_segments_to_download += added;
                info.num_server_participants += 1;
            }
        }

        server_segment_changes.insert(
            server.clone(),
            ServerSegmentChange {
                status,
                segments_before: existing_segments.len(),
                segments_after: new_segments.len(),
                segments_added: added,
                segments_deleted: deleted,
                segments_unchanged: unchanged,
                tags,
            },
        );
    }

    for (server, existing_segments) in &existing_by_server {
        if server_segment_changes.contains_key(server) {
            continue;
        }
        servers_removed.insert(server.clone());
        total_segments_to_be_deleted += existing_segments.len();
        server_segment_changes.insert(
            server.clone(),
            ServerSegmentChange {
                status: ServerStatus::Removed,
                segments_before: existing_segments.len(),
                segments_after: 0,
                segments_added: 0,
                segments_deleted: existing_segments.len(),
                segments_unchanged: 0,
                tags: ctx.instance_tags.get(server).cloned().unwrap_or_default(),
            },
        );
    }

    let existing_total = existing_replication * current.len();
    let new_total = new_replication * target.len();
    let total_segments_to_be_moved = new_total.saturating_sub(segments_not_moved);

    let table_size_per_replica = read_table_size(table, ctx).await;
    let estimated_average_segment_size_bytes = if table_size_per_replica < 0 || current.is_empty() {
        -1
    } else {
        table_size_per_replica / current.len() as i64
    };
    let total_estimated_data_to_move_bytes = if estimated_average_segment_size_bytes < 0 {
        -1
    } else {
        total_segments_to_be_moved as i64 * estimated_average_segment_size_bytes
    };

    let consuming = match table.table_type {
        TableType::Offline => None,
        TableType::Realtime => {
            Some(consuming_segment_summary(table, current, target, ctx).await)
        }
    };

    RebalanceSummary {
        server_info: ServerInfo {
            num_servers: ChangeInfo {
                before: existing_by_server.len(),
                after: new_by_server.len(),
            },
            servers_added,
            servers_removed,
            servers_unchanged,
            servers_getting_new_segments,
            server_segment_changes,
        },
        segment_info: SegmentInfo {
            total_segments_to_be_moved,
            total_segments_to_be_deleted,
            max_segments_added_to_single_server,
            estimated_average_segment_size_bytes,
            total_estimated_data_to_move_bytes,
            replication_factor: ChangeInfo { before: existing_replication, after: new_replication },
            num_segments_in_single_replica: ChangeInfo {
                before: current.len(),
                after: target.len(),
            },
            num_segments_across_all_replicas: ChangeInfo {
                before: existing_total,
                after: new_total,
            },
            consuming,
        },
        tags_info,
    }
}

async fn read_table_size(table: &TableConfig, ctx: &SummaryContext<'_>) -> i64 {
    let Some(size_reader) = ctx.size_reader else { return -1 };
    match size_reader.table_size_per_replica_bytes(&table.name, ctx.size_read_timeout).await {
        Ok(size) => size as i64,
        Err(error) => {
            warn!(table = %table.name, %error, "Failed to read table size, omitting size estimates");
            -1
        }
    }
}

async fn consuming_segment_summary(
    table: &TableConfig,
    current: &PlacementMap,
    target: &PlacementMap,
    ctx: &SummaryContext<'_>,
) -> ConsumingSegmentSummary {
    let existing_consuming = server_to_consuming_segments(current);
    let mut added_consuming = server_to_consuming_segments(target);

    // Keep only the consuming segments each server does not already host.
    for (server, segments) in &mut added_consuming {
        if let Some(existing) = existing_consuming.get(server) {
            segments.retain(|segment| !existing.contains(segment));
        }
    }
    added_consuming.retain(|_, segments| !segments.is_empty());

    let num_consuming_segments_to_move: usize =
        added_consuming.values().map(BTreeSet::len).sum();
    let unique_segments: BTreeSet<SegmentId> =
        added_consuming.values().flatten().cloned().collect();

    let metadata = fetch_consuming_metadata(table, &unique_segments, ctx).await;
    let ages = consuming_segment_ages(&metadata);
    let offsets = consuming_offsets_to_catch_up(table, &metadata, ctx).await;

    let per_server = added_consuming
        .iter()
        .map(|(server, segments)| {
            let total_offsets_to_catch_up = match &offsets {
                Some(offsets) => segments.iter().filter_map(|s| offsets.get(s)).sum(),
                None => -1,
            };
            (
                server.clone(),
                ConsumingPerServer {
                    num_consuming_segments_added: segments.len(),
                    total_offsets_to_catch_up,
                },
            )
        })
        .collect();

    ConsumingSegmentSummary {
        num_consuming_segments_to_move,
        num_servers_getting_consuming_segments: added_consuming.len(),
        top_offsets_to_catch_up: offsets
            .map(|offsets| top_n_descending(&offsets, TOP_N_CONSUMING_SEGMENT_SUMMARY)),
        oldest_segments_minutes: ages
            .map(|ages| top_n_descending(&ages, TOP_N_CONSUMING_SEGMENT_SUMMARY)),
        per_server,
    }
}

/// Fetches metadata for every consuming segment; `None` as soon as any
/// segment cannot be described.
async fn fetch_consuming_metadata(
    table: &TableConfig,
    segments: &BTreeSet<SegmentId>,
    ctx: &SummaryContext<'_>,
) -> Option<BTreeMap<SegmentId, SegmentMetadata>> {
    let oracle = ctx.segment_metadata?;
    let mut metadata = BTreeMap::new();
    for segment in segments {
        match oracle.segment_metadata(&table.name, segment).await {
            Ok(meta) => {
                metadata.insert(segment.clone(), meta);
            }
            Err(error) => {
                warn!(segment = %segment, %error, "Failed to read segment metadata");
                return None;
            }
        }
    }
    Some(metadata)
}

fn consuming_segment_ages(
    metadata: &Option<BTreeMap<SegmentId, SegmentMetadata>>,
) -> Option<BTreeMap<SegmentId, i64>> {
    let metadata = metadata.as_ref()?;
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0);
    let mut ages = BTreeMap::new();
    for (segment, meta) in metadata {
        if meta.creation_time_ms < 0 {
            warn!(segment = %segment, "Creation time missing, omitting consuming segment ages");
            return None;
        }
        ages.insert(segment.clone(), (now_ms - meta.creation_time_ms) / 60_000);
    }
    Some(ages)
}

async fn consuming_offsets_to_catch_up(
    table: &TableConfig,
    metadata: &Option<BTreeMap<SegmentId, SegmentMetadata>>,
    ctx: &SummaryContext<'_>,
) -> Option<BTreeMap<SegmentId, i64>> {
    let metadata = metadata.as_ref()?;
    let stream = ctx.stream_metadata?;
    let mut offsets = BTreeMap::new();
    for (segment, meta) in metadata {
        let start_offset = meta.start_offset?;
        let partition_id = meta.partition_id?;
        let latest = match stream
            .fetch_largest_offset(&table.name, partition_id, ctx.offset_read_timeout)
            .await
        {
            Ok(latest) => latest,
            Err(error) => {
                warn!(segment = %segment, partition_id, %error, "Failed to read stream offset");
                return None;
            }
        };
        offsets.insert(segment.clone(), latest - start_offset);
    }
    Some(offsets)
}
