//! Placement store gateway
//!
//! Versioned read and compare-and-set access to the authoritative ideal
//! state, read access to the reported external view, and storage for the
//! instance partitions and instance config documents that live alongside
//! them.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::model::{IdealState, InstanceConfig, PlacementMap, SegmentState, Version};
use crate::partitions::InstancePartitions;

/// Store errors
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("Ideal state not found for table: {0}")]
    NotFound(String),

    #[error("Version mismatch updating ideal state: expected {expected}, found {actual}")]
    VersionMismatch { expected: Version, actual: Version },

    #[error("Transient store error: {0}")]
    Transient(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Versioned access to the cluster's placement documents.
///
/// All reads are point-in-time; implementations must not cache. The ideal
/// state is only ever written through [`PlacementStore::update_ideal_state`]
/// with the version observed by the caller.
#[async_trait::async_trait]
pub trait PlacementStore: Send + Sync {
    /// Reads the ideal state document and its current version.
    async fn read_ideal_state(&self, table: &str) -> Result<(IdealState, Version)>;

    /// Reads the reported external view. A freshly created table may not have
    /// one yet, which is not an error.
    async fn read_external_view(&self, table: &str) -> Result<Option<PlacementMap>>;

    /// Compare-and-set update of the ideal state. Succeeds only if the stored
    /// version still equals `expected`, and returns the new version.
    async fn update_ideal_state(
        &self,
        table: &str,
        ideal_state: &IdealState,
        expected: Version,
    ) -> Result<Version>;

    /// Reads all instance configs, used to resolve server tags.
    async fn read_instance_configs(&self) -> Result<Vec<InstanceConfig>>;

    /// Reads a persisted instance partitions document by name.
    async fn read_instance_partitions(&self, name: &str) -> Result<Option<InstancePartitions>>;

    /// Persists an instance partitions document, replacing any existing one.
    async fn write_instance_partitions(&self, partitions: &InstancePartitions) -> Result<()>;

    /// Removes a persisted instance partitions document if present.
    async fn remove_instance_partitions(&self, name: &str) -> Result<()>;
}

#[derive(Default)]
struct MemoryStoreInner {
    ideal_states: BTreeMap<String, (IdealState, Version)>,
    external_views: BTreeMap<String, PlacementMap>,
    instance_partitions: BTreeMap<String, InstancePartitions>,
    instance_configs: Vec<InstanceConfig>,
}

/// In-process placement store.
///
/// Complete implementation of [`PlacementStore`] backed by process memory,
/// used by the test suite and by embedders that drive the rebalancer against
/// simulated clusters. The extra methods below the trait impl mutate the
/// external view the way live servers would.
#[derive(Default)]
pub struct MemoryPlacementStore {
    inner: Mutex<MemoryStoreInner>,
}

impl MemoryPlacementStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Seeds a table with an ideal state at version 0 and no external view.
    pub fn seed_table(&self, table: &str, ideal_state: IdealState) {
        let mut inner = self.inner.lock();
        inner.ideal_states.insert(table.to_string(), (ideal_state, 0));
    }

    pub fn set_instance_configs(&self, configs: Vec<InstanceConfig>) {
        self.inner.lock().instance_configs = configs;
    }

    /// Overwrites the external view entry for one segment.
    pub fn set_external_view_segment(
        &self,
        table: &str,
        segment: &str,
        states: crate::model::InstanceStateMap,
    ) {
        let mut inner = self.inner.lock();
        inner
            .external_views
            .entry(table.to_string())
            .or_default()
            .insert(segment.to_string(), states);
    }

    /// Converges the external view to the current ideal state, as a cluster
    /// of healthy servers eventually would: non-OFFLINE ideal entries are
    /// copied over, everything else is dropped.
    pub fn converge_external_view(&self, table: &str) {
        let mut inner = self.inner.lock();
        let Some((ideal_state, _)) = inner.ideal_states.get(table) else { return };
        let mut view = PlacementMap::new();
        for (segment, instance_states) in &ideal_state.segments {
            let served: crate::model::InstanceStateMap = instance_states
                .iter()
                .filter(|(_, state)| **state != SegmentState::Offline)
                .map(|(instance, state)| (instance.clone(), *state))
                .collect();
            if !served.is_empty() {
                view.insert(segment.clone(), served);
            }
        }
        inner.external_views.insert(table.to_string(), view);
    }

    /// Current ideal state version, for assertions.
    pub fn ideal_state_version(&self, table: &str) -> Option<Version> {
        self.inner.lock().ideal_states.get(table).map(|(_, version)| *version)
    }
}

#[async_trait::async_trait]
impl PlacementStore for MemoryPlacementStore {
    async fn read_ideal_state(&self, table: &str) -> Result<(IdealState, Version)> {
        self.inner
            .lock()
            .ideal_states
            .get(table)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(table.to_string()))
    }

    async fn read_external_view(&self, table: &str) -> Result<Option<PlacementMap>> {
        Ok(self.inner.lock().external_views.get(table).cloned())
    }

    async fn update_ideal_state(
        &self,
        table: &str,
        ideal_state: &IdealState,
        expected: Version,
    ) -> Result<Version> {
        let mut inner = self.inner.lock();
        let entry = inner
            .ideal_states
            .get_mut(table)
            .ok_or_else(|| StoreError::NotFound(table.to_string()))?;
        if entry.1 != expected {
            return Err(StoreError::VersionMismatch { expected, actual: entry.1 });
        }
        entry.0 = ideal_state.clone();
        entry.1 += 1;
        Ok(entry.1)
    }

    async fn read_instance_configs(&self) -> Result<Vec<InstanceConfig>> {
        Ok(self.inner.lock().instance_configs.clone())
    }

    async fn read_instance_partitions(&self, name: &str) -> Result<Option<InstancePartitions>> {
        Ok(self.inner.lock().instance_partitions.get(name).cloned())
    }

    async fn write_instance_partitions(&self, partitions: &InstancePartitions) -> Result<()> {
        self.inner
            .lock()
            .instance_partitions
            .insert(partitions.name.clone(), partitions.clone());
        Ok(())
    }

    async fn remove_instance_partitions(&self, name: &str) -> Result<()> {
        self.inner.lock().instance_partitions.remove(name);
        Ok(())
    }
}
