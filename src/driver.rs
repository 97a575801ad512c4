//! Rebalance driver
//!
//! The top-level state machine tying the resolver, policy, planner,
//! convergence predicate, and force-commit coordinator together:
//! - Plans a target placement and walks the ideal state toward it in safe
//!   steps, each written with compare-and-set on the observed version
//! - Waits for the external view to converge between steps, extending the
//!   stabilization timeout only while measurable progress is made
//! - Re-plans when the ideal state is mutated concurrently
//!
//! A single driver task owns all placement decisions for one run; if the
//! process dies mid-run the rebalance is abandoned and must be re-triggered.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::assignment::SegmentAssignmentPolicy;
use crate::config::{resolve_min_available_replicas, RebalanceConfig};
use crate::convergence::{is_converged, remaining_replicas, ConvergenceOptions};
use crate::error::RebalanceError;
use crate::force_commit::{
    force_commit_and_wait, ForceCommitBatchConfig, ForceCommitError, RealtimeSegmentManager,
};
use crate::model::{
    moving_consuming_segments, segments_moved_per_instance, segments_to_move, IdealState,
    PlacementMap, SegmentId, TableConfig, TableType, Version,
};
use crate::observer::{NoopObserver, RebalanceObserver, RebalanceProgress, Trigger};
use crate::partitions::{
    DefaultInstanceAssigner, InstanceAssigner, InstancePartitions, PartitionCategory,
    PartitionsResolver, ResolveOptions,
};
use crate::planner::{
    default_partition_id, next_assignment, PartitionIdFetcher, PlannerError, PlannerOptions,
};
use crate::result::{RebalanceResult, RebalanceStatus};
use crate::store::{PlacementStore, StoreError};
use crate::summary::{
    calculate_summary, RebalanceSummary, SegmentMetadataOracle, StreamMetadataOracle,
    SummaryContext, TableSizeReader,
};

const TABLE_SIZE_READ_TIMEOUT: Duration = Duration::from_secs(30);
const STREAM_OFFSET_READ_TIMEOUT: Duration = Duration::from_secs(10);

static REBALANCE_JOBS_IN_PROGRESS: AtomicI64 = AtomicI64::new(0);

/// Drives a table's ideal state toward a policy-computed target placement.
pub struct TableRebalancer {
    store: Arc<dyn PlacementStore>,
    policy: Arc<dyn SegmentAssignmentPolicy>,
    observer: Arc<dyn RebalanceObserver>,
    assigner: Arc<dyn InstanceAssigner>,
    partition_id_fetcher: Option<Arc<dyn PartitionIdFetcher + Send + Sync>>,
    realtime_manager: Option<Arc<dyn RealtimeSegmentManager>>,
    size_reader: Option<Arc<dyn TableSizeReader>>,
    segment_metadata: Option<Arc<dyn SegmentMetadataOracle>>,
    stream_metadata: Option<Arc<dyn StreamMetadataOracle>>,
}

impl TableRebalancer {
    pub fn new(store: Arc<dyn PlacementStore>, policy: Arc<dyn SegmentAssignmentPolicy>) -> Self {
        Self {
            store,
            policy,
            observer: Arc::new(NoopObserver),
            assigner: Arc::new(DefaultInstanceAssigner),
            partition_id_fetcher: None,
            realtime_manager: None,
            size_reader: None,
            segment_metadata: None,
            stream_metadata: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn RebalanceObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_instance_assigner(mut self, assigner: Arc<dyn InstanceAssigner>) -> Self {
        self.assigner = assigner;
        self
    }

    pub fn with_partition_id_fetcher(
        mut self,
        fetcher: Arc<dyn PartitionIdFetcher + Send + Sync>,
    ) -> Self {
        self.partition_id_fetcher = Some(fetcher);
        self
    }

    pub fn with_realtime_manager(mut self, manager: Arc<dyn RealtimeSegmentManager>) -> Self {
        self.realtime_manager = Some(manager);
        self
    }

    pub fn with_size_reader(mut self, size_reader: Arc<dyn TableSizeReader>) -> Self {
        self.size_reader = Some(size_reader);
        self
    }

    pub fn with_segment_metadata_oracle(mut self, oracle: Arc<dyn SegmentMetadataOracle>) -> Self {
        self.segment_metadata = Some(oracle);
        self
    }

    pub fn with_stream_metadata_oracle(mut self, oracle: Arc<dyn StreamMetadataOracle>) -> Self {
        self.stream_metadata = Some(oracle);
        self
    }

    /// Number of rebalance jobs currently running in this process.
    pub fn jobs_in_progress() -> i64 {
        REBALANCE_JOBS_IN_PROGRESS.load(Ordering::SeqCst)
    }

    pub fn new_job_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Runs one rebalance to a terminal status. Never panics on cluster
    /// state; every fatal path reports through the observer exactly once and
    /// is captured in the returned result.
    pub async fn rebalance(
        &self,
        table: &TableConfig,
        config: &RebalanceConfig,
        job_id: Option<String>,
    ) -> RebalanceResult {
        let job_id = job_id.unwrap_or_else(Self::new_job_id);
        let jobs = REBALANCE_JOBS_IN_PROGRESS.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(jobs, "Rebalance job starting");
        let result = self.do_rebalance(table, config, job_id).await;
        REBALANCE_JOBS_IN_PROGRESS.fetch_sub(1, Ordering::SeqCst);
        info!(
            table = %table.name,
            job_id = %result.job_id,
            status = %result.status,
            "Rebalance finished"
        );
        result
    }

    async fn do_rebalance(
        &self,
        table: &TableConfig,
        config: &RebalanceConfig,
        job_id: String,
    ) -> RebalanceResult {
        let mut run = RunState::new(job_id, self.observer.clone());

        if let Err(err) = config.validate() {
            return run.fail("Not triggering rebalance", err.into());
        }
        let mut force_commit = config.force_commit;
        if table.table_type == TableType::Offline && force_commit {
            warn!(table = %table.name, "force_commit is set for an OFFLINE table, resetting it to false");
            force_commit = false;
        }

        info!(
            table = %table.name,
            job_id = %run.job_id,
            dry_run = config.dry_run,
            pre_checks = config.pre_checks,
            reassign_instances = config.reassign_instances,
            include_consuming = config.include_consuming,
            bootstrap = config.bootstrap,
            downtime = config.downtime,
            min_available_replicas = config.min_available_replicas,
            strict_replica_group = table.strict_replica_group_routing,
            low_disk_mode = config.low_disk_mode,
            best_effort = config.best_effort,
            batch_size_per_server = config.batch_size_per_server,
            force_commit,
            "Start rebalancing"
        );

        let (mut ideal_state, mut expected_version) =
            match self.store.read_ideal_state(&table.name).await {
                Ok(read) => read,
                Err(err) => {
                    return run.fail(
                        "Failed to fetch the ideal state, aborting the rebalance",
                        err.into(),
                    )
                }
            };
        if !ideal_state.enabled && !config.downtime {
            return run.fail(
                "Aborting the rebalance",
                RebalanceError::DisabledTable(table.name.clone()),
            );
        }

        info!(table = %table.name, "Processing instance partitions");
        let resolver = PartitionsResolver::new(self.store.clone(), self.assigner.clone());
        let resolve_opts = ResolveOptions {
            reassign_instances: config.reassign_instances,
            bootstrap: config.bootstrap,
            dry_run: config.dry_run,
            minimize_data_movement: config.minimize_data_movement,
        };
        let (mut partitions, partitions_unchanged) =
            match resolver.resolve(table, resolve_opts).await {
                Ok(resolved) => resolved,
                Err(err) => {
                    return run.fail(
                        "Failed to resolve instance partitions, aborting the rebalance",
                        err.into(),
                    )
                }
            };
        run.partitions = Some(partitions.clone());

        let sorted_tiers = table.tiers.clone();
        let (mut tier_partitions, tier_partitions_unchanged) =
            match resolver.resolve_tiers(table, &sorted_tiers, resolve_opts).await {
                Ok(resolved) => resolved,
                Err(err) => {
                    return run.fail(
                        "Failed to resolve tier instance partitions, aborting the rebalance",
                        err.into(),
                    )
                }
            };
        run.tier_partitions = Some(tier_partitions.clone());

        info!(table = %table.name, "Calculating the target assignment");
        let mut current = ideal_state.segments.clone();
        let mut target = match self.policy.rebalance(
            &current,
            &partitions,
            &sorted_tiers,
            &tier_partitions,
            config,
        ) {
            Ok(target) => target,
            Err(err) => {
                return run.fail(
                    "Failed to calculate the target assignment, aborting the rebalance",
                    err.into(),
                )
            }
        };
        run.target = Some(target.clone());

        let assignment_unchanged = current == target;
        let all_partitions_unchanged = partitions_unchanged && tier_partitions_unchanged;
        info!(
            instance_partitions_unchanged = all_partitions_unchanged,
            segment_assignment_unchanged = assignment_unchanged,
            "Finished planning"
        );

        // Computed even for a no-op so callers can verify that outcome.
        let summary = self.compute_summary(table, &current, &target).await;
        let estimated_segment_size = summary.segment_info.estimated_average_segment_size_bytes;
        run.summary = Some(summary);

        if assignment_unchanged {
            info!(table = %table.name, "Table is already balanced");
            if all_partitions_unchanged {
                run.observer.on_noop("Instance partitions unchanged and table is already balanced");
                return run.result(RebalanceStatus::NoOp, "Table is already balanced");
            }
            return run.result(
                RebalanceStatus::Done,
                "Instance partitions reassigned, segment placement is already balanced",
            );
        }

        if config.dry_run {
            info!(table = %table.name, "Rebalancing in dry-run mode, returning the target assignment");
            return run.result(RebalanceStatus::Done, "Dry-run mode");
        }

        if config.downtime {
            return self
                .rebalance_with_downtime(
                    table, config, force_commit, run, ideal_state, expected_version, current, target,
                )
                .await;
        }

        // Minimum available replicas resolve against the smallest target
        // replica count among the moving segments; a placement already below
        // the floor keeps whatever replicas it has.
        let mut moving = segments_to_move(&current, &target);
        let target_replicas = moving.iter().filter_map(|s| target.get(s)).map(BTreeMap::len).min();
        let Some(target_replicas) = target_replicas else {
            return run.result(RebalanceStatus::Done, "No segments to move");
        };
        let Some(mut min_available) =
            resolve_min_available_replicas(config.min_available_replicas, target_replicas)
        else {
            return run.fail(
                "Aborting the rebalance",
                RebalanceError::InvalidConfig(format!(
                    "min_available_replicas: {} must be less than the number of replicas: {}",
                    config.min_available_replicas, target_replicas
                )),
            );
        };
        let current_replicas =
            moving.iter().filter_map(|s| current.get(s)).map(BTreeMap::len).min().unwrap_or(0);
        if min_available > current_replicas {
            warn!(
                min_available,
                current_replicas,
                "min_available_replicas larger than the existing replica count, clamping"
            );
            min_available = current_replicas;
        }
        info!(
            min_available_replicas = min_available,
            strict_replica_group = table.strict_replica_group_routing,
            best_effort = config.best_effort,
            "Rebalancing without downtime"
        );

        let planner_opts = PlannerOptions {
            min_available_replicas: min_available,
            strict_replica_group: table.strict_replica_group_routing,
            low_disk_mode: config.low_disk_mode,
            batch_size_per_server: config.batch_size_per_server,
        };
        let fetcher = DriverPartitionIdFetcher {
            custom: self.partition_id_fetcher.clone(),
            strict_realtime: self.policy.is_strict_realtime(),
        };
        let mut partition_ids: HashMap<SegmentId, u32> = HashMap::new();

        let mut all_segments: BTreeSet<SegmentId> = current.keys().cloned().collect();
        let mut monitored: BTreeSet<SegmentId> = moving.clone();
        let mut force_commit_pending = force_commit;

        run.observer.on_trigger(
            Trigger::Start,
            Some(&current),
            Some(&target),
            &progress(estimated_segment_size, all_segments.clone(), Some(monitored.clone()), 0),
        );

        loop {
            let converged = match self
                .wait_for_external_view(
                    table,
                    config,
                    &monitored,
                    estimated_segment_size,
                    &mut all_segments,
                )
                .await
            {
                Ok(WaitOutcome::Converged { ideal_state, version }) => (ideal_state, version),
                Ok(WaitOutcome::Stopped) => {
                    return run.result(
                        run.observer.stop_status(),
                        "Rebalance stopped while waiting for the external view to converge",
                    )
                }
                Err(err) => {
                    return run.fail(
                        "Failed while waiting for the external view to converge, aborting the \
                         rebalance",
                        err,
                    )
                }
            };
            ideal_state = converged.0;
            let mut observed_version: Version = converged.1;

            // Re-plan when the ideal state moved under us, and run the
            // one-shot force commit; both can require another pass.
            loop {
                let mut needs_recalculation = false;

                if observed_version != expected_version {
                    info!(
                        observed_version,
                        expected_version,
                        "Ideal state version changed while waiting for the external view, \
                         re-calculating the target assignment"
                    );
                    let old_current = std::mem::replace(&mut current, ideal_state.segments.clone());
                    expected_version = observed_version;

                    let mut moving_changed = self.policy.is_strict_realtime();
                    if !moving_changed {
                        for segment in &moving {
                            if old_current.get(segment) != current.get(segment) {
                                info!(segment = %segment, "Moving segment changed in the ideal state");
                                moving_changed = true;
                                break;
                            }
                        }
                    }

                    if moving_changed {
                        // Instance configs may have changed during the wait,
                        // so partitions are resolved again as well.
                        let replan_opts = ResolveOptions { dry_run: false, ..resolve_opts };
                        match resolver.resolve(table, replan_opts).await {
                            Ok((resolved, _)) => partitions = resolved,
                            Err(err) => {
                                return run.fail(
                                    "Failed to re-resolve instance partitions, aborting the \
                                     rebalance",
                                    err.into(),
                                )
                            }
                        }
                        match resolver.resolve_tiers(table, &sorted_tiers, replan_opts).await {
                            Ok((resolved, _)) => tier_partitions = resolved,
                            Err(err) => {
                                return run.fail(
                                    "Failed to re-resolve tier instance partitions, aborting the \
                                     rebalance",
                                    err.into(),
                                )
                            }
                        }
                        run.partitions = Some(partitions.clone());
                        run.tier_partitions = Some(tier_partitions.clone());
                        target = match self.policy.rebalance(
                            &current,
                            &partitions,
                            &sorted_tiers,
                            &tier_partitions,
                            config,
                        ) {
                            Ok(target) => target,
                            Err(err) => {
                                return run.fail(
                                    "Failed to re-calculate the target assignment, aborting the \
                                     rebalance",
                                    err.into(),
                                )
                            }
                        };
                    } else {
                        // Still-moving segments keep their previous target;
                        // everything else adopts the new ideal state.
                        info!(
                            "No state change for the moving segments, keeping the previous target \
                             for them"
                        );
                        let old_target = std::mem::replace(&mut target, current.clone());
                        for segment in &moving {
                            if let Some(instance_states) = old_target.get(segment) {
                                target.insert(segment.clone(), instance_states.clone());
                            }
                        }
                    }
                    run.target = Some(target.clone());
                }

                if force_commit_pending {
                    force_commit_pending = false;
                    let probe = match next_assignment(
                        &current,
                        &target,
                        &planner_opts,
                        &mut partition_ids,
                        &fetcher,
                    ) {
                        Ok(probe) => probe,
                        Err(err) => {
                            return run.fail(
                                "Failed to calculate the next assignment, aborting the rebalance",
                                err.into(),
                            )
                        }
                    };
                    let to_commit = moving_consuming_segments(&current, &probe);
                    if !to_commit.is_empty() {
                        needs_recalculation = true;
                        run.observer.on_trigger(
                            Trigger::ForceCommitStart,
                            None,
                            None,
                            &progress(estimated_segment_size, all_segments.clone(), None, 0),
                        );
                        let committed = match self.force_commit(table, &to_commit, config).await {
                            Ok(committed) => committed,
                            Err(err) => {
                                return run.fail(
                                    "Failed to force commit consuming segments, aborting the \
                                     rebalance",
                                    err.into(),
                                )
                            }
                        };
                        match self.store.read_ideal_state(&table.name).await {
                            Ok((read, version)) => {
                                ideal_state = read;
                                observed_version = version;
                            }
                            Err(err) => {
                                return run.fail(
                                    "Failed to re-fetch the ideal state after force commit, \
                                     aborting the rebalance",
                                    err.into(),
                                )
                            }
                        }
                        run.observer.on_trigger(
                            Trigger::ForceCommitEnd,
                            None,
                            None,
                            &progress(
                                estimated_segment_size,
                                all_segments.clone(),
                                None,
                                committed.len(),
                            ),
                        );
                    }
                }

                if !needs_recalculation {
                    break;
                }
            }

            if current == target {
                let message = format!(
                    "Finished rebalancing table {} without downtime, min_available_replicas: {}",
                    table.name, min_available
                );
                info!("{message}");
                run.observer.on_success(&message);
                return run.result(
                    RebalanceStatus::Done,
                    "Success: both the ideal state and the external view should reach the target \
                     placement",
                );
            }

            let step_progress =
                progress(estimated_segment_size, all_segments.clone(), None, 0);
            run.observer.on_trigger(
                Trigger::IdealStateChange,
                Some(&current),
                Some(&target),
                &step_progress,
            );
            if run.observer.is_stopped() {
                return run.result(
                    run.observer.stop_status(),
                    "Rebalance stopped before updating the ideal state",
                );
            }

            let next = match next_assignment(
                &current,
                &target,
                &planner_opts,
                &mut partition_ids,
                &fetcher,
            ) {
                Ok(next) => next,
                Err(err) => {
                    return run.fail(
                        "Failed to calculate the next assignment, aborting the rebalance",
                        err.into(),
                    )
                }
            };
            info!(
                moves = ?segments_moved_per_instance(&current, &next),
                "Computed the next assignment"
            );
            run.observer.on_trigger(
                Trigger::NextAssignmentCalculation,
                Some(&current),
                Some(&next),
                &step_progress,
            );
            if run.observer.is_stopped() {
                return run.result(
                    run.observer.stop_status(),
                    "Rebalance stopped before updating the ideal state with the next assignment",
                );
            }

            ideal_state.apply_placement(next.clone());
            match self.store.update_ideal_state(&table.name, &ideal_state, expected_version).await {
                Ok(new_version) => {
                    expected_version = new_version;
                    current = next;
                    all_segments = current.keys().cloned().collect();
                    info!(version = new_version, "Successfully updated the ideal state");
                }
                Err(StoreError::VersionMismatch { .. }) => {
                    info!("Version changed while updating the ideal state, re-planning");
                    run.observer.on_rollback();
                    continue;
                }
                Err(err) => {
                    return run.fail(
                        "Failed to update the ideal state, aborting the rebalance",
                        err.into(),
                    );
                }
            }

            // Monitor both the previous step's moves and the new ones so the
            // previous step is confirmed converged too.
            let previous_moving = std::mem::replace(&mut moving, segments_to_move(&current, &target));
            monitored = previous_moving;
            monitored.extend(moving.iter().cloned());
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn rebalance_with_downtime(
        &self,
        table: &TableConfig,
        config: &RebalanceConfig,
        force_commit: bool,
        mut run: RunState,
        mut ideal_state: IdealState,
        mut expected_version: Version,
        mut current: PlacementMap,
        mut target: PlacementMap,
    ) -> RebalanceResult {
        info!(table = %table.name, "Rebalancing with downtime");

        if force_commit {
            let to_commit = moving_consuming_segments(&current, &target);
            if !to_commit.is_empty() {
                if let Err(err) = self.force_commit(table, &to_commit, config).await {
                    return run.fail(
                        "Failed to force commit consuming segments, aborting the rebalance",
                        err.into(),
                    );
                }
                match self.store.read_ideal_state(&table.name).await {
                    Ok((read, version)) => {
                        ideal_state = read;
                        expected_version = version;
                    }
                    Err(err) => {
                        return run.fail(
                            "Failed to re-fetch the ideal state after force commit, aborting the \
                             rebalance",
                            err.into(),
                        )
                    }
                }
                current = ideal_state.segments.clone();
                let partitions = run.partitions.clone().unwrap_or_default();
                let tier_partitions = run.tier_partitions.clone().unwrap_or_default();
                target = match self.policy.rebalance(
                    &current,
                    &partitions,
                    &table.tiers,
                    &tier_partitions,
                    config,
                ) {
                    Ok(target) => target,
                    Err(err) => {
                        return run.fail(
                            "Failed to re-calculate the target assignment, aborting the rebalance",
                            err.into(),
                        )
                    }
                };
                run.target = Some(target.clone());
            }
        }

        ideal_state.apply_placement(target);
        match self.store.update_ideal_state(&table.name, &ideal_state, expected_version).await {
            Ok(_) => {
                let message = format!("Finished rebalancing table {} with downtime", table.name);
                info!("{message}");
                run.observer.on_success(&message);
                run.result(
                    RebalanceStatus::Done,
                    "Success with downtime: replaced the ideal state with the target placement; \
                     the external view may not have caught up yet",
                )
            }
            Err(err) => run.fail(
                "Failed to update the ideal state, aborting the rebalance",
                err.into(),
            ),
        }
    }

    /// Polls the external view until it converges to the ideal state for the
    /// monitored segments, extending the stabilization timeout as long as the
    /// number of remaining replicas keeps strictly decreasing.
    async fn wait_for_external_view(
        &self,
        table: &TableConfig,
        config: &RebalanceConfig,
        monitored: &BTreeSet<SegmentId>,
        estimated_segment_size: i64,
        all_segments: &mut BTreeSet<SegmentId>,
    ) -> Result<WaitOutcome, RebalanceError> {
        let check_interval = config.external_view_check_interval();
        let stabilization_timeout = config.external_view_stabilization_timeout();
        let start = Instant::now();
        let mut deadline = start + stabilization_timeout;
        let mut extensions: u32 = 0;
        let mut previous_remaining: Option<usize> = None;
        let mut last_read: Option<(IdealState, Version, PlacementMap)> = None;

        info!(
            monitored = monitored.len(),
            "Waiting for the external view to converge to the ideal state"
        );
        loop {
            loop {
                let (ideal_state, version) = self.store.read_ideal_state(&table.name).await?;
                let external_view = self.store.read_external_view(&table.name).await?;

                // A table that was just created may not report an external
                // view yet; skip the check for this iteration.
                if let Some(external_view) = external_view {
                    self.observer.on_trigger(
                        Trigger::EvToIsConvergence,
                        Some(&external_view),
                        Some(&ideal_state.segments),
                        &progress(
                            estimated_segment_size,
                            all_segments.clone(),
                            Some(monitored.clone()),
                            0,
                        ),
                    );
                    *all_segments = ideal_state.segments.keys().cloned().collect();
                    if self.observer.is_stopped() {
                        return Ok(WaitOutcome::Stopped);
                    }

                    let opts = ConvergenceOptions {
                        low_disk_mode: config.low_disk_mode,
                        best_effort: config.best_effort,
                        monitored: Some(monitored),
                    };
                    if is_converged(&external_view, &ideal_state.segments, opts)? {
                        info!(
                            elapsed = ?start.elapsed(),
                            extensions,
                            "External view converged to the ideal state"
                        );
                        return Ok(WaitOutcome::Converged { ideal_state, version });
                    }
                    if previous_remaining.is_none() {
                        let remaining =
                            remaining_replicas(&external_view, &ideal_state.segments, opts, false)?;
                        info!(remaining, "Segment replicas remaining to be processed");
                        previous_remaining = Some(remaining);
                    }
                    last_read = Some((ideal_state, version, external_view));
                }

                debug!(
                    retry_after = ?check_interval,
                    "External view has not converged to the ideal state"
                );
                tokio::time::sleep(check_interval).await;
                if Instant::now() >= deadline {
                    break;
                }
            }

            let Some((ideal_state, version, external_view)) = last_read.take() else {
                warn!("External view never appeared, not extending the stabilization timeout");
                return Err(RebalanceError::ConvergenceTimeout {
                    timeout: stabilization_timeout,
                    extensions,
                });
            };

            let opts = ConvergenceOptions {
                low_disk_mode: config.low_disk_mode,
                best_effort: config.best_effort,
                monitored: Some(monitored),
            };
            let current_remaining =
                remaining_replicas(&external_view, &ideal_state.segments, opts, false)?;

            // The remaining count can grow when consuming segments commit and
            // flip to ONLINE, un-converging replicas that already matched.
            if previous_remaining.is_some_and(|previous| current_remaining >= previous) {
                if config.best_effort {
                    warn!(
                        waited = ?start.elapsed(),
                        extensions,
                        "External view made no progress, continuing the rebalance (best-effort)"
                    );
                    return Ok(WaitOutcome::Converged { ideal_state, version });
                }
                return Err(RebalanceError::ConvergenceTimeout {
                    timeout: stabilization_timeout,
                    extensions,
                });
            }

            extensions += 1;
            info!(
                remaining = current_remaining,
                extensions, "Extending the external view stabilization timeout"
            );
            previous_remaining = Some(current_remaining);
            deadline = Instant::now() + stabilization_timeout;
        }
    }

    async fn force_commit(
        &self,
        table: &TableConfig,
        segments: &BTreeSet<SegmentId>,
        config: &RebalanceConfig,
    ) -> Result<BTreeSet<SegmentId>, ForceCommitError> {
        let manager =
            self.realtime_manager.as_deref().ok_or(ForceCommitError::NotConfigured)?;
        let batch = ForceCommitBatchConfig::from_rebalance_config(config);
        force_commit_and_wait(manager, &table.name, segments, &batch).await
    }

    async fn compute_summary(
        &self,
        table: &TableConfig,
        current: &PlacementMap,
        target: &PlacementMap,
    ) -> RebalanceSummary {
        info!(table = %table.name, "Calculating rebalance summary");
        let instance_tags = match self.store.read_instance_configs().await {
            Ok(configs) => configs
                .into_iter()
                .map(|config| (config.instance, config.tags))
                .collect(),
            Err(error) => {
                warn!(%error, "Failed to read instance configs, tag breakdown will be empty");
                BTreeMap::new()
            }
        };
        let ctx = SummaryContext {
            size_reader: self.size_reader.as_deref(),
            segment_metadata: self.segment_metadata.as_deref(),
            stream_metadata: self.stream_metadata.as_deref(),
            instance_tags,
            size_read_timeout: TABLE_SIZE_READ_TIMEOUT,
            offset_read_timeout: STREAM_OFFSET_READ_TIMEOUT,
        };
        calculate_summary(table, current, target, &ctx).await
    }
}

enum WaitOutcome {
    Converged { ideal_state: IdealState, version: Version },
    Stopped,
}

/// Partition id lookup handed to the planner: the embedder-supplied fetcher
/// first, then the stable name hash. A missing id is fatal only for
/// strict-realtime policies, which cannot assign without one.
struct DriverPartitionIdFetcher {
    custom: Option<Arc<dyn PartitionIdFetcher + Send + Sync>>,
    strict_realtime: bool,
}

impl PartitionIdFetcher for DriverPartitionIdFetcher {
    fn partition_id(&self, segment: &str) -> Result<u32, PlannerError> {
        if let Some(fetcher) = &self.custom {
            match fetcher.partition_id(segment) {
                Ok(id) => return Ok(id),
                Err(err) if self.strict_realtime => return Err(err),
                Err(_) => {}
            }
        } else if self.strict_realtime {
            return Err(PlannerError::MissingPartitionId(segment.to_string()));
        }
        Ok(default_partition_id(segment))
    }
}

fn progress(
    estimated_segment_size_bytes: i64,
    all_segments: BTreeSet<SegmentId>,
    segments_to_monitor: Option<BTreeSet<SegmentId>>,
    segments_force_committed: usize,
) -> RebalanceProgress {
    RebalanceProgress {
        estimated_segment_size_bytes,
        all_segments,
        segments_to_monitor,
        segments_force_committed,
    }
}

/// Snapshots accumulated over a run, attached to the terminal result. Fatal
/// paths flow through [`RunState::fail`], which reports to the observer
/// exactly once.
struct RunState {
    job_id: String,
    observer: Arc<dyn RebalanceObserver>,
    partitions: Option<BTreeMap<PartitionCategory, InstancePartitions>>,
    tier_partitions: Option<BTreeMap<String, InstancePartitions>>,
    target: Option<PlacementMap>,
    summary: Option<RebalanceSummary>,
}

impl RunState {
    fn new(job_id: String, observer: Arc<dyn RebalanceObserver>) -> Self {
        Self {
            job_id,
            observer,
            partitions: None,
            tier_partitions: None,
            target: None,
            summary: None,
        }
    }

    fn result(&self, status: RebalanceStatus, description: impl Into<String>) -> RebalanceResult {
        let mut result = RebalanceResult::new(self.job_id.clone(), status, description);
        result.instance_partitions = self.partitions.clone();
        result.tier_instance_partitions = self.tier_partitions.clone();
        result.target_placement = self.target.clone();
        result.summary = self.summary.clone();
        result
    }

    fn fail(&mut self, context: &str, error: RebalanceError) -> RebalanceResult {
        let message = format!("{context}: {error}");
        warn!("{message}");
        self.observer.on_error(&message);
        self.result(RebalanceStatus::Failed, message)
    }
}
