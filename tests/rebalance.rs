//! End-to-end rebalance scenarios
//!
//! Drives the real rebalance driver against the in-memory placement store,
//! with a background task playing the role of servers converging the
//! external view to the ideal state.
//!
//! Run with: cargo test --test rebalance

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use strata_rebalancer::force_commit::ForceCommitBatchConfig;
use strata_rebalancer::{
    IdealState, InstanceStateMap, MemoryPlacementStore, PlacementMap, PlacementStore,
    RealtimeSegmentManager, RebalanceConfig, RebalanceObserver, RebalanceProgress,
    RebalanceStatus, SegmentId, SegmentState, StoreError, TableConfig, TableRebalancer,
    TableType, Trigger, Version,
};

const TABLE: &str = "orders";

fn online(instances: &[&str]) -> InstanceStateMap {
    instances.iter().map(|i| (i.to_string(), SegmentState::Online)).collect()
}

fn consuming(instances: &[&str]) -> InstanceStateMap {
    instances.iter().map(|i| (i.to_string(), SegmentState::Consuming)).collect()
}

fn placement(entries: &[(&str, InstanceStateMap)]) -> PlacementMap {
    entries.iter().map(|(s, m)| (s.to_string(), m.clone())).collect()
}

fn offline_table() -> TableConfig {
    let mut table = TableConfig::new(TABLE, TableType::Offline, 2);
    table.server_tag = "orders_tag".to_string();
    table
}

fn realtime_table() -> TableConfig {
    let mut table = TableConfig::new(TABLE, TableType::Realtime, 2);
    table.server_tag = "orders_tag".to_string();
    table
}

fn seed_instances(store: &MemoryPlacementStore) {
    store.set_instance_configs(
        ["i1", "i2", "i3", "i4"]
            .iter()
            .map(|instance| strata_rebalancer::InstanceConfig {
                instance: instance.to_string(),
                tags: vec!["orders_tag".to_string()],
                enabled: true,
            })
            .collect(),
    );
}

/// Timings small enough that a full multi-step rebalance finishes in well
/// under a second.
fn fast_config() -> RebalanceConfig {
    RebalanceConfig {
        external_view_check_interval_ms: 5,
        external_view_stabilization_timeout_ms: 400,
        ..Default::default()
    }
}

/// Keeps the external view converged to the ideal state, as healthy servers
/// would. Aborted when the test runtime shuts down.
fn spawn_ev_sync(store: Arc<MemoryPlacementStore>) {
    tokio::spawn(async move {
        loop {
            store.converge_external_view(TABLE);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    });
}

/// One attempted ideal state write.
#[derive(Debug, Clone)]
struct WriteAttempt {
    expected: Version,
    placement: PlacementMap,
    ok: bool,
}

/// Store wrapper recording every CAS attempt, optionally injecting one
/// concurrent foreign write right before the driver's first CAS.
struct TestStore {
    inner: Arc<MemoryPlacementStore>,
    writes: Mutex<Vec<WriteAttempt>>,
    interfere_once: AtomicBool,
}

impl TestStore {
    fn new(inner: Arc<MemoryPlacementStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            writes: Mutex::new(Vec::new()),
            interfere_once: AtomicBool::new(false),
        })
    }

    fn writes(&self) -> Vec<WriteAttempt> {
        self.writes.lock().unwrap().clone()
    }

    fn successful_placements(&self) -> Vec<PlacementMap> {
        self.writes().into_iter().filter(|w| w.ok).map(|w| w.placement).collect()
    }
}

#[async_trait::async_trait]
impl PlacementStore for TestStore {
    async fn read_ideal_state(
        &self,
        table: &str,
    ) -> Result<(IdealState, Version), StoreError> {
        self.inner.read_ideal_state(table).await
    }

    async fn read_external_view(&self, table: &str) -> Result<Option<PlacementMap>, StoreError> {
        self.inner.read_external_view(table).await
    }

    async fn update_ideal_state(
        &self,
        table: &str,
        ideal_state: &IdealState,
        expected: Version,
    ) -> Result<Version, StoreError> {
        if self.interfere_once.swap(false, Ordering::SeqCst) {
            // A concurrent writer rewrites the document, bumping its version.
            let (doc, version) = self.inner.read_ideal_state(table).await?;
            self.inner.update_ideal_state(table, &doc, version).await?;
        }
        let result = self.inner.update_ideal_state(table, ideal_state, expected).await;
        self.writes.lock().unwrap().push(WriteAttempt {
            expected,
            placement: ideal_state.segments.clone(),
            ok: result.is_ok(),
        });
        result
    }

    async fn read_instance_configs(
        &self,
    ) -> Result<Vec<strata_rebalancer::InstanceConfig>, StoreError> {
        self.inner.read_instance_configs().await
    }

    async fn read_instance_partitions(
        &self,
        name: &str,
    ) -> Result<Option<strata_rebalancer::InstancePartitions>, StoreError> {
        self.inner.read_instance_partitions(name).await
    }

    async fn write_instance_partitions(
        &self,
        partitions: &strata_rebalancer::InstancePartitions,
    ) -> Result<(), StoreError> {
        self.inner.write_instance_partitions(partitions).await
    }

    async fn remove_instance_partitions(&self, name: &str) -> Result<(), StoreError> {
        self.inner.remove_instance_partitions(name).await
    }
}

#[derive(Default)]
struct RecordingObserver {
    triggers: Mutex<Vec<Trigger>>,
    errors: Mutex<Vec<String>>,
    noops: Mutex<Vec<String>>,
    rollbacks: AtomicUsize,
    stopped: AtomicBool,
}

impl RecordingObserver {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn triggers(&self) -> Vec<Trigger> {
        self.triggers.lock().unwrap().clone()
    }

    fn error_count(&self) -> usize {
        self.errors.lock().unwrap().len()
    }
}

impl RebalanceObserver for RecordingObserver {
    fn on_trigger(
        &self,
        trigger: Trigger,
        _current: Option<&PlacementMap>,
        _target: Option<&PlacementMap>,
        _progress: &RebalanceProgress,
    ) {
        self.triggers.lock().unwrap().push(trigger);
    }

    fn on_noop(&self, message: &str) {
        self.noops.lock().unwrap().push(message.to_string());
    }

    fn on_error(&self, message: &str) {
        self.errors.lock().unwrap().push(message.to_string());
    }

    fn on_rollback(&self) {
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

fn make_rebalancer(
    store: Arc<TestStore>,
    target: PlacementMap,
    observer: Arc<RecordingObserver>,
) -> TableRebalancer {
    TableRebalancer::new(store, Arc::new(strata_rebalancer::StaticAssignment::new(target)))
        .with_observer(observer)
}

#[tokio::test]
async fn no_op_when_already_balanced() {
    let inner = MemoryPlacementStore::new();
    let current = placement(&[("s1", online(&["i1", "i2"]))]);
    inner.seed_table(TABLE, IdealState::new(current.clone(), 2));
    seed_instances(&inner);
    let store = TestStore::new(inner);
    let observer = RecordingObserver::new();

    let rebalancer = make_rebalancer(store.clone(), current, observer.clone());
    let result = rebalancer.rebalance(&offline_table(), &fast_config(), None).await;

    assert_eq!(result.status, RebalanceStatus::NoOp);
    assert!(store.writes().is_empty(), "no-op must not write the ideal state");
    assert_eq!(observer.noops.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn downtime_swap_is_a_single_write() {
    let inner = MemoryPlacementStore::new();
    inner.seed_table(TABLE, IdealState::new(placement(&[("s1", online(&["i1", "i2"]))]), 2));
    seed_instances(&inner);
    let store = TestStore::new(inner.clone());
    let observer = RecordingObserver::new();

    let target = placement(&[("s1", online(&["i3", "i4"]))]);
    let rebalancer = make_rebalancer(store.clone(), target.clone(), observer);
    let config = RebalanceConfig { downtime: true, ..fast_config() };
    let result = rebalancer.rebalance(&offline_table(), &config, None).await;

    assert_eq!(result.status, RebalanceStatus::Done);
    let writes = store.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].placement, target);
    let (ideal_state, version) = inner.read_ideal_state(TABLE).await.unwrap();
    assert_eq!(ideal_state.segments, target);
    assert_eq!(version, 1);
}

#[tokio::test]
async fn no_downtime_swap_keeps_replicas_available() {
    let inner = MemoryPlacementStore::new();
    let current = placement(&[("s1", online(&["i1", "i2"]))]);
    inner.seed_table(TABLE, IdealState::new(current.clone(), 2));
    seed_instances(&inner);
    spawn_ev_sync(inner.clone());
    let store = TestStore::new(inner.clone());
    let observer = RecordingObserver::new();

    let target = placement(&[("s1", online(&["i3", "i4"]))]);
    let rebalancer = make_rebalancer(store.clone(), target.clone(), observer.clone());
    let result = rebalancer.rebalance(&offline_table(), &fast_config(), None).await;

    assert_eq!(result.status, RebalanceStatus::Done);
    let placements = store.successful_placements();
    assert!(placements.len() >= 2, "a full swap needs at least two steps");
    assert_eq!(*placements.last().unwrap(), target);

    // Every step keeps at least one replica of s1 up.
    let mut previous = &current;
    for step in &placements {
        let kept = previous["s1"].keys().filter(|i| step["s1"].contains_key(*i)).count();
        assert!(kept >= 1, "step dropped every replica of s1");
        previous = step;
    }

    // CAS safety: expected versions of successful writes never repeat.
    let expected: Vec<Version> =
        store.writes().iter().filter(|w| w.ok).map(|w| w.expected).collect();
    let unique: BTreeSet<Version> = expected.iter().copied().collect();
    assert_eq!(unique.len(), expected.len());

    let triggers = observer.triggers();
    assert_eq!(triggers[0], Trigger::Start);
    assert!(triggers.contains(&Trigger::NextAssignmentCalculation));
}

#[tokio::test]
async fn strict_replica_group_moves_partitions_together() {
    let inner = MemoryPlacementStore::new();
    let current = placement(&[
        ("p0_a", online(&["i1", "i2"])),
        ("p0_b", online(&["i1", "i2"])),
        ("p0_c", online(&["i1", "i2"])),
        ("p0_d", online(&["i1", "i2"])),
    ]);
    inner.seed_table(TABLE, IdealState::new(current, 2));
    seed_instances(&inner);
    spawn_ev_sync(inner.clone());
    let store = TestStore::new(inner);
    let observer = RecordingObserver::new();

    let target = placement(&[
        ("p0_a", online(&["i3", "i4"])),
        ("p0_b", online(&["i3", "i4"])),
        ("p0_c", online(&["i3", "i4"])),
        ("p0_d", online(&["i3", "i4"])),
    ]);
    let mut table = offline_table();
    table.strict_replica_group_routing = true;

    /// Reads the partition id out of "p<N>_..." segment names.
    struct PrefixPartitionId;

    impl strata_rebalancer::PartitionIdFetcher for PrefixPartitionId {
        fn partition_id(
            &self,
            segment: &str,
        ) -> Result<u32, strata_rebalancer::PlannerError> {
            segment
                .strip_prefix('p')
                .and_then(|rest| rest.split('_').next())
                .and_then(|id| id.parse().ok())
                .ok_or_else(|| {
                    strata_rebalancer::PlannerError::MissingPartitionId(segment.to_string())
                })
        }
    }

    let rebalancer = make_rebalancer(store.clone(), target.clone(), observer)
        .with_partition_id_fetcher(Arc::new(PrefixPartitionId));
    // The whole partition exceeds the per-server ceiling; it must still move
    // as one unit.
    let config = RebalanceConfig { batch_size_per_server: 2, ..fast_config() };
    let result = rebalancer.rebalance(&table, &config, None).await;

    assert_eq!(result.status, RebalanceStatus::Done);
    for step in store.successful_placements() {
        let first = &step["p0_a"];
        for segment in ["p0_b", "p0_c", "p0_d"] {
            assert_eq!(&step[segment], first, "partition split across instance sets");
        }
    }
}

#[tokio::test]
async fn error_replica_fails_the_rebalance() {
    let inner = MemoryPlacementStore::new();
    let current = placement(&[("s1", online(&["i1", "i2"]))]);
    inner.seed_table(TABLE, IdealState::new(current, 2));
    seed_instances(&inner);
    let store = TestStore::new(inner.clone());
    let observer = RecordingObserver::new();

    // Servers apply the ideal state except i3, which lands in ERROR. Each
    // segment is written in one shot so the view never looks clean.
    let ev_store = inner.clone();
    tokio::spawn(async move {
        loop {
            let (ideal_state, _) = ev_store.read_ideal_state(TABLE).await.unwrap();
            for (segment, states) in &ideal_state.segments {
                let mut reported: InstanceStateMap = states
                    .iter()
                    .filter(|(_, state)| **state != SegmentState::Offline)
                    .map(|(instance, state)| (instance.clone(), *state))
                    .collect();
                if reported.contains_key("i3") {
                    reported.insert("i3".to_string(), SegmentState::Error);
                }
                ev_store.set_external_view_segment(TABLE, segment, reported);
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    });

    let target = placement(&[("s1", online(&["i3", "i4"]))]);
    let rebalancer = make_rebalancer(store, target, observer.clone());
    let result = rebalancer.rebalance(&offline_table(), &fast_config(), None).await;

    assert_eq!(result.status, RebalanceStatus::Failed);
    assert!(result.description.contains("ERROR"));
    assert_eq!(observer.error_count(), 1, "on_error must fire exactly once");
}

#[tokio::test]
async fn concurrent_ideal_state_write_triggers_rollback_and_retry() {
    let inner = MemoryPlacementStore::new();
    let current = placement(&[("s1", online(&["i1", "i2"]))]);
    inner.seed_table(TABLE, IdealState::new(current, 2));
    seed_instances(&inner);
    spawn_ev_sync(inner.clone());
    let store = TestStore::new(inner);
    store.interfere_once.store(true, Ordering::SeqCst);
    let observer = RecordingObserver::new();

    let target = placement(&[("s1", online(&["i3", "i4"]))]);
    let rebalancer = make_rebalancer(store.clone(), target.clone(), observer.clone());
    let result = rebalancer.rebalance(&offline_table(), &fast_config(), None).await;

    assert_eq!(result.status, RebalanceStatus::Done);
    assert_eq!(observer.rollbacks.load(Ordering::SeqCst), 1);

    let writes = store.writes();
    assert!(!writes[0].ok, "first CAS must lose to the foreign write");
    let successful: Vec<&WriteAttempt> = writes.iter().filter(|w| w.ok).collect();
    assert_eq!(*store.successful_placements().last().unwrap(), target);

    // No two successful writes share an expected version, and the failed
    // attempt's version was never reused successfully at the same value.
    let expected: BTreeSet<Version> = successful.iter().map(|w| w.expected).collect();
    assert_eq!(expected.len(), successful.len());
    assert!(!expected.contains(&writes[0].expected));
}

#[tokio::test]
async fn stop_requested_before_any_write_returns_stop_status() {
    let inner = MemoryPlacementStore::new();
    let current = placement(&[("s1", online(&["i1", "i2"]))]);
    inner.seed_table(TABLE, IdealState::new(current, 2));
    seed_instances(&inner);
    spawn_ev_sync(inner.clone());
    let store = TestStore::new(inner.clone());
    let observer = RecordingObserver::new();
    observer.stopped.store(true, Ordering::SeqCst);

    let target = placement(&[("s1", online(&["i3", "i4"]))]);
    let rebalancer = make_rebalancer(store.clone(), target, observer.clone());
    let result = rebalancer.rebalance(&offline_table(), &fast_config(), None).await;

    assert_eq!(result.status, RebalanceStatus::Cancelled);
    assert!(store.writes().is_empty(), "no placement may be written after a stop");
    assert_eq!(observer.error_count(), 0);
    assert_eq!(inner.ideal_state_version(TABLE), Some(0));
}

#[tokio::test]
async fn stalled_external_view_times_out_without_best_effort() {
    let inner = MemoryPlacementStore::new();
    let current = placement(&[("s1", online(&["i1", "i2"]))]);
    inner.seed_table(TABLE, IdealState::new(current.clone(), 2));
    seed_instances(&inner);
    // The external view matches the seed placement and then never moves.
    inner.converge_external_view(TABLE);
    let store = TestStore::new(inner);
    let observer = RecordingObserver::new();

    let target = placement(&[("s1", online(&["i3", "i4"]))]);
    let rebalancer = make_rebalancer(store, target, observer.clone());
    let config = RebalanceConfig {
        external_view_check_interval_ms: 5,
        external_view_stabilization_timeout_ms: 60,
        ..Default::default()
    };
    let result = rebalancer.rebalance(&offline_table(), &config, None).await;

    assert_eq!(result.status, RebalanceStatus::Failed);
    assert!(result.description.contains("no progress"));
    assert_eq!(observer.error_count(), 1);
}

#[tokio::test]
async fn stalled_external_view_proceeds_with_best_effort() {
    let inner = MemoryPlacementStore::new();
    let current = placement(&[("s1", online(&["i1", "i2"]))]);
    inner.seed_table(TABLE, IdealState::new(current, 2));
    seed_instances(&inner);
    inner.converge_external_view(TABLE);
    let store = TestStore::new(inner.clone());
    let observer = RecordingObserver::new();

    let target = placement(&[("s1", online(&["i3", "i4"]))]);
    let rebalancer = make_rebalancer(store.clone(), target.clone(), observer);
    let config = RebalanceConfig {
        best_effort: true,
        external_view_check_interval_ms: 5,
        external_view_stabilization_timeout_ms: 60,
        ..Default::default()
    };
    let result = rebalancer.rebalance(&offline_table(), &config, None).await;

    assert_eq!(result.status, RebalanceStatus::Done);
    let (ideal_state, _) = inner.read_ideal_state(TABLE).await.unwrap();
    assert_eq!(ideal_state.segments, target);
}

#[tokio::test]
async fn done_when_partitions_reassigned_but_placement_balanced() {
    let inner = MemoryPlacementStore::new();
    let current = placement(&[("s1", online(&["i1", "i2"]))]);
    inner.seed_table(TABLE, IdealState::new(current.clone(), 2));
    seed_instances(&inner);
    inner.set_instance_configs(vec![
        strata_rebalancer::InstanceConfig {
            instance: "i1".to_string(),
            tags: vec!["orders_tag".to_string()],
            enabled: true,
        },
        strata_rebalancer::InstanceConfig {
            instance: "i2".to_string(),
            tags: vec!["orders_tag".to_string()],
            enabled: true,
        },
    ]);
    let store = TestStore::new(inner);
    let observer = RecordingObserver::new();

    let rebalancer = make_rebalancer(store.clone(), current, observer.clone());
    // Reassignment writes instance partitions for the first time, so they
    // count as changed even though no segment moves.
    let config = RebalanceConfig { reassign_instances: true, ..fast_config() };
    let result = rebalancer.rebalance(&offline_table(), &config, None).await;

    assert_eq!(result.status, RebalanceStatus::Done);
    assert!(result.description.contains("reassigned"));
    assert!(store.writes().is_empty());
    assert!(observer.noops.lock().unwrap().is_empty());
}

#[tokio::test]
async fn force_commit_on_offline_table_is_disabled_with_a_warning() {
    let inner = MemoryPlacementStore::new();
    let current = placement(&[("tail", consuming(&["i1", "i2"]))]);
    inner.seed_table(TABLE, IdealState::new(current, 2));
    seed_instances(&inner);
    let store = TestStore::new(inner);
    let observer = RecordingObserver::new();

    let target = placement(&[("tail", consuming(&["i3", "i4"]))]);
    // No realtime manager configured: if force_commit were honored for the
    // OFFLINE table this run would fail instead of completing.
    let rebalancer = make_rebalancer(store.clone(), target, observer.clone());
    let config = RebalanceConfig { downtime: true, force_commit: true, ..fast_config() };
    let result = rebalancer.rebalance(&offline_table(), &config, None).await;

    assert_eq!(result.status, RebalanceStatus::Done);
    assert_eq!(store.writes().len(), 1);
    assert!(!observer.triggers().contains(&Trigger::ForceCommitStart));
}

/// Realtime manager that records what it was asked to commit.
#[derive(Default)]
struct RecordingRealtimeManager {
    commits: Mutex<Vec<BTreeSet<SegmentId>>>,
}

#[async_trait::async_trait]
impl RealtimeSegmentManager for RecordingRealtimeManager {
    async fn force_commit(
        &self,
        _table: &str,
        segments: &BTreeSet<SegmentId>,
        _batch: &ForceCommitBatchConfig,
    ) -> Result<BTreeSet<SegmentId>, strata_rebalancer::ForceCommitError> {
        self.commits.lock().unwrap().push(segments.clone());
        Ok(segments.clone())
    }

    async fn segments_yet_to_be_committed(
        &self,
        _table: &str,
        _segments: &BTreeSet<SegmentId>,
    ) -> Result<BTreeSet<SegmentId>, strata_rebalancer::ForceCommitError> {
        Ok(BTreeSet::new())
    }
}

#[tokio::test]
async fn force_commit_runs_once_before_moving_consuming_segments() {
    let inner = MemoryPlacementStore::new();
    let current = placement(&[("tail", consuming(&["i1", "i2"]))]);
    inner.seed_table(TABLE, IdealState::new(current, 2));
    seed_instances(&inner);
    spawn_ev_sync(inner.clone());
    let store = TestStore::new(inner);
    let observer = RecordingObserver::new();
    let manager = Arc::new(RecordingRealtimeManager::default());

    let target = placement(&[("tail", consuming(&["i3", "i4"]))]);
    let rebalancer = TableRebalancer::new(
        store.clone(),
        Arc::new(strata_rebalancer::StaticAssignment::new(target.clone())),
    )
    .with_observer(observer.clone())
    .with_realtime_manager(manager.clone());

    let config = RebalanceConfig { force_commit: true, ..fast_config() };
    let result = rebalancer.rebalance(&realtime_table(), &config, None).await;

    assert_eq!(result.status, RebalanceStatus::Done);
    let commits = manager.commits.lock().unwrap().clone();
    assert_eq!(commits.len(), 1, "force commit must run once per rebalance");
    assert!(commits[0].contains("tail"));

    let triggers = observer.triggers();
    let start = triggers.iter().position(|t| *t == Trigger::ForceCommitStart).unwrap();
    let end = triggers.iter().position(|t| *t == Trigger::ForceCommitEnd).unwrap();
    assert!(start < end);
    let first_write = triggers.iter().position(|t| *t == Trigger::NextAssignmentCalculation).unwrap();
    assert!(end < first_write, "commit must finish before the first placement write");
}
