//! Force-commit coordinator
//!
//! Before a consuming (tail-of-stream) segment can move, it must be
//! committed. The coordinator asks the external realtime manager to commit a
//! set of segments and polls until every one of them is done or the batch
//! timeout elapses.

use std::collections::BTreeSet;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::RebalanceConfig;
use crate::model::SegmentId;

/// Force-commit errors
#[derive(Error, Debug, Clone)]
pub enum ForceCommitError {
    #[error("Realtime manager error: {0}")]
    Manager(String),

    #[error("Timed out waiting for {pending} segments to commit after {waited:?}")]
    Timeout { pending: usize, waited: Duration },

    #[error("No realtime manager configured for this rebalancer")]
    NotConfigured,
}

pub type Result<T> = std::result::Result<T, ForceCommitError>;

/// Batching knobs for one force-commit round.
#[derive(Debug, Clone, Copy)]
pub struct ForceCommitBatchConfig {
    pub batch_size: usize,
    pub check_interval: Duration,
    pub timeout: Duration,
}

impl ForceCommitBatchConfig {
    pub fn from_rebalance_config(config: &RebalanceConfig) -> Self {
        Self {
            batch_size: config.force_commit_batch_size,
            check_interval: Duration::from_millis(
                config.force_commit_batch_status_check_interval_ms,
            ),
            timeout: Duration::from_millis(config.force_commit_batch_status_check_timeout_ms),
        }
    }
}

/// External realtime manager responsible for committing consuming segments.
#[async_trait::async_trait]
pub trait RealtimeSegmentManager: Send + Sync {
    /// Triggers a commit for the given segments. The returned set is the
    /// segments actually being committed, which the manager may refine.
    async fn force_commit(
        &self,
        table: &str,
        segments: &BTreeSet<SegmentId>,
        batch: &ForceCommitBatchConfig,
    ) -> Result<BTreeSet<SegmentId>>;

    /// Subset of `segments` whose commit has not finished yet.
    async fn segments_yet_to_be_committed(
        &self,
        table: &str,
        segments: &BTreeSet<SegmentId>,
    ) -> Result<BTreeSet<SegmentId>>;
}

/// Commits the given consuming segments and waits until all of them are done.
/// Returns the set the manager actually committed.
pub async fn force_commit_and_wait(
    manager: &dyn RealtimeSegmentManager,
    table: &str,
    segments: &BTreeSet<SegmentId>,
    batch: &ForceCommitBatchConfig,
) -> Result<BTreeSet<SegmentId>> {
    info!(table, segments = segments.len(), "Force committing consuming segments before moving them");
    let committed = manager.force_commit(table, segments, batch).await?;
    wait_until_committed(manager, table, &committed, batch).await?;
    info!(table, segments = committed.len(), "Force commit finished");
    Ok(committed)
}

/// Polls the realtime manager until every segment has committed or the batch
/// timeout elapses.
pub async fn wait_until_committed(
    manager: &dyn RealtimeSegmentManager,
    table: &str,
    segments: &BTreeSet<SegmentId>,
    batch: &ForceCommitBatchConfig,
) -> Result<()> {
    let start = Instant::now();
    let mut pending = segments.clone();
    loop {
        pending = manager.segments_yet_to_be_committed(table, &pending).await?;
        if pending.is_empty() {
            return Ok(());
        }
        let waited = start.elapsed();
        if waited >= batch.timeout {
            return Err(ForceCommitError::Timeout { pending: pending.len(), waited });
        }
        debug!(table, pending = pending.len(), "Waiting for segments to commit");
        tokio::time::sleep(batch.check_interval).await;
    }
}
