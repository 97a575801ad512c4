//! Instance partitions resolver
//!
//! Fetches or computes the logical instance groupings (OFFLINE, CONSUMING,
//! COMPLETED, and per-tier) consumed by the assignment policy, persisting
//! recomputed groupings back to the placement store when allowed.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::config::Enablement;
use crate::model::{InstanceConfig, InstanceId, TableConfig, TableType, Tier};
use crate::store::{PlacementStore, StoreError};

/// Resolver errors
#[derive(Error, Debug)]
pub enum PartitionsError {
    #[error("No enabled instances carry tag: {0}")]
    NoInstancesForTag(String),

    #[error("Instance assignment failed: {0}")]
    Assignment(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, PartitionsError>;

/// Category of segments an instance grouping applies to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PartitionCategory {
    Offline,
    Consuming,
    Completed,
    Tier(String),
}

impl fmt::Display for PartitionCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offline => write!(f, "OFFLINE"),
            Self::Consuming => write!(f, "CONSUMING"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Tier(name) => write!(f, "TIER__{name}"),
        }
    }
}

/// A structured assignment of instances to replica-groups and partitions.
///
/// Stored keyed by `"<partition>_<replicaGroup>"`, the same layout the
/// assignment policies consume. Equality is structural, which is what the
/// resolver's `unchanged` flag is computed from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstancePartitions {
    pub name: String,
    pub num_partitions: usize,
    pub num_replica_groups: usize,
    partitions: BTreeMap<String, Vec<InstanceId>>,
}

impl InstancePartitions {
    pub fn new(name: impl Into<String>, num_partitions: usize, num_replica_groups: usize) -> Self {
        Self {
            name: name.into(),
            num_partitions,
            num_replica_groups,
            partitions: BTreeMap::new(),
        }
    }

    /// Name of the persisted document for a table and category.
    pub fn name_for(table: &str, category: &PartitionCategory) -> String {
        format!("{table}__{category}")
    }

    pub fn instances(&self, partition: usize, replica_group: usize) -> &[InstanceId] {
        self.partitions
            .get(&Self::key(partition, replica_group))
            .map_or(&[], Vec::as_slice)
    }

    pub fn set_instances(
        &mut self,
        partition: usize,
        replica_group: usize,
        instances: Vec<InstanceId>,
    ) {
        self.partitions.insert(Self::key(partition, replica_group), instances);
    }

    fn key(partition: usize, replica_group: usize) -> String {
        format!("{partition}_{replica_group}")
    }
}

/// Options controlling one resolution pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResolveOptions {
    /// Recompute groupings from current instance configs via the assigner.
    pub reassign_instances: bool,
    /// Ignore previously persisted groupings when reassigning.
    pub bootstrap: bool,
    /// Never persist or remove documents.
    pub dry_run: bool,
    pub minimize_data_movement: Enablement,
}

/// Pluggable driver computing an instance grouping from instance configs.
#[async_trait::async_trait]
pub trait InstanceAssigner: Send + Sync {
    async fn assign(
        &self,
        table: &TableConfig,
        category: &PartitionCategory,
        instance_configs: &[InstanceConfig],
        existing: Option<&InstancePartitions>,
        minimize_data_movement: Enablement,
    ) -> Result<InstancePartitions>;
}

/// Tag-based default allocation: every enabled instance carrying the relevant
/// server tag lands in a single partition and replica group, sorted.
pub struct DefaultInstanceAssigner;

#[async_trait::async_trait]
impl InstanceAssigner for DefaultInstanceAssigner {
    async fn assign(
        &self,
        table: &TableConfig,
        category: &PartitionCategory,
        instance_configs: &[InstanceConfig],
        _existing: Option<&InstancePartitions>,
        _minimize_data_movement: Enablement,
    ) -> Result<InstancePartitions> {
        let tag = match category {
            PartitionCategory::Tier(name) => table
                .tiers
                .iter()
                .find(|tier| &tier.name == name)
                .map(|tier| tier.server_tag.clone())
                .unwrap_or_else(|| table.server_tag.clone()),
            _ => table.server_tag.clone(),
        };
        default_instance_partitions(&table.name, category, &tag, instance_configs)
    }
}

/// Computes the default single-group partitions for a tag.
pub fn default_instance_partitions(
    table: &str,
    category: &PartitionCategory,
    tag: &str,
    instance_configs: &[InstanceConfig],
) -> Result<InstancePartitions> {
    let mut instances: Vec<InstanceId> = instance_configs
        .iter()
        .filter(|config| config.enabled && config.tags.iter().any(|t| t == tag))
        .map(|config| config.instance.clone())
        .collect();
    if instances.is_empty() {
        return Err(PartitionsError::NoInstancesForTag(tag.to_string()));
    }
    instances.sort();

    let mut partitions = InstancePartitions::new(InstancePartitions::name_for(table, category), 1, 1);
    partitions.set_instances(0, 0, instances);
    Ok(partitions)
}

/// Resolves the instance partitions for every category applicable to a table.
pub struct PartitionsResolver {
    store: Arc<dyn PlacementStore>,
    assigner: Arc<dyn InstanceAssigner>,
}

impl PartitionsResolver {
    pub fn new(store: Arc<dyn PlacementStore>, assigner: Arc<dyn InstanceAssigner>) -> Self {
        Self { store, assigner }
    }

    /// Resolves the applicable categories for the table and reports whether
    /// every resolved grouping matches what was previously persisted. The
    /// flag is advisory; correctness does not depend on it.
    pub async fn resolve(
        &self,
        table: &TableConfig,
        opts: ResolveOptions,
    ) -> Result<(BTreeMap<PartitionCategory, InstancePartitions>, bool)> {
        let mut by_category = BTreeMap::new();
        let mut unchanged = true;

        match table.table_type {
            TableType::Offline => {
                let (partitions, partitions_unchanged) =
                    self.resolve_category(table, PartitionCategory::Offline, opts).await?;
                by_category.insert(PartitionCategory::Offline, partitions);
                unchanged &= partitions_unchanged;
            }
            TableType::Realtime => {
                let (partitions, partitions_unchanged) =
                    self.resolve_category(table, PartitionCategory::Consuming, opts).await?;
                by_category.insert(PartitionCategory::Consuming, partitions);
                unchanged &= partitions_unchanged;

                if table.relocate_completed_segments {
                    let (partitions, partitions_unchanged) =
                        self.resolve_category(table, PartitionCategory::Completed, opts).await?;
                    by_category.insert(PartitionCategory::Completed, partitions);
                    unchanged &= partitions_unchanged;
                } else {
                    // The category no longer applies; drop any stale document.
                    let name =
                        InstancePartitions::name_for(&table.name, &PartitionCategory::Completed);
                    if !opts.dry_run {
                        self.store.remove_instance_partitions(&name).await?;
                    }
                }
            }
        }

        Ok((by_category, unchanged))
    }

    /// Resolves per-tier partitions for the given sorted tiers.
    pub async fn resolve_tiers(
        &self,
        table: &TableConfig,
        sorted_tiers: &[Tier],
        opts: ResolveOptions,
    ) -> Result<(BTreeMap<String, InstancePartitions>, bool)> {
        let mut by_tier = BTreeMap::new();
        let mut unchanged = true;
        for tier in sorted_tiers {
            let category = PartitionCategory::Tier(tier.name.clone());
            let (partitions, partitions_unchanged) =
                self.resolve_category(table, category, opts).await?;
            by_tier.insert(tier.name.clone(), partitions);
            unchanged &= partitions_unchanged;
        }
        Ok((by_tier, unchanged))
    }

    async fn resolve_category(
        &self,
        table: &TableConfig,
        category: PartitionCategory,
        opts: ResolveOptions,
    ) -> Result<(InstancePartitions, bool)> {
        let name = InstancePartitions::name_for(&table.name, &category);
        let existing = self.store.read_instance_partitions(&name).await?;

        if opts.reassign_instances {
            let instance_configs = self.store.read_instance_configs().await?;
            let computed = self
                .assigner
                .assign(
                    table,
                    &category,
                    &instance_configs,
                    if opts.bootstrap { None } else { existing.as_ref() },
                    opts.minimize_data_movement,
                )
                .await?;
            let unchanged = existing.as_ref() == Some(&computed);
            if !opts.dry_run && !unchanged {
                info!(partitions = %computed.name, "Persisting recomputed instance partitions");
                self.store.write_instance_partitions(&computed).await?;
            }
            return Ok((computed, unchanged));
        }

        // Without reassignment, use what is persisted, or fall back to the
        // tag-based default for tables that never had a grouping written.
        match existing {
            Some(partitions) => Ok((partitions, true)),
            None => {
                let instance_configs = self.store.read_instance_configs().await?;
                let tag = match &category {
                    PartitionCategory::Tier(tier_name) => table
                        .tiers
                        .iter()
                        .find(|tier| &tier.name == tier_name)
                        .map(|tier| tier.server_tag.as_str())
                        .unwrap_or(table.server_tag.as_str()),
                    _ => table.server_tag.as_str(),
                };
                let partitions =
                    default_instance_partitions(&table.name, &category, tag, &instance_configs)?;
                Ok((partitions, true))
            }
        }
    }
}
