/**
 * SYNC ORCHESTRATOR - one collection cycle, end to end
 *
 * ROLE:
 * Opens a sync log, polls the whole roster, writes the cycle's node and network
 * snapshots under one shared `created_at`, then closes the log with counts and
 * duration. `trigger` adds the retention sweep and is what the HTTP endpoint
 * and the scheduler call.
 *
 * FAILURE MODEL:
 * - unreachable nodes are counted, never raised
 * - zero successes is a successful cycle that writes no snapshots
 * - a store failure while writing snapshots closes the log with the error and
 *   reports `success: false`
 * - a store failure while opening the log is returned as `SyncError`
 *
 * Overlapping cycles are allowed; each one owns its own log id.
 */

use crate::aggregate::{aggregate, node_snapshot, unstorable_field};
use crate::collector::collect;
use crate::models::{
    NetworkSnapshot, NodeReading, NodeSnapshot, NodeStats, RetentionReport, SyncCompletion,
    SyncLogId, SyncOutcome, SyncStatus,
};
use crate::prpc::{ProbeError, StatsSource};
use crate::retention::RetentionPolicy;
use crate::state::{new_state, snapshot, Shared};
use crate::store::{SnapshotStore, StoreError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("could not open sync log: {0}")]
    SyncLogCreation(#[source] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    Idle,
    Running,
    Completed,
    Failed,
}

/// Response body of a manual or scheduled trigger.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub success: bool,
    pub sync: SyncOutcome,
    pub cleanup: Option<RetentionReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleanup_error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// Live poll of the whole roster, nothing persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveRoster {
    pub total_nodes: usize,
    pub active_nodes: usize,
    pub nodes: Vec<NodeReading>,
}

pub struct SyncService {
    roster: Vec<String>,
    source: Arc<dyn StatsSource>,
    store: Arc<dyn SnapshotStore>,
    retention: RetentionPolicy,
    average_latency_ms: f64,
    phase: Shared<SyncPhase>,
    cycles_completed: AtomicU64,
    cycles_failed: AtomicU64,
}

impl SyncService {
    pub fn new(
        roster: Vec<String>,
        source: Arc<dyn StatsSource>,
        store: Arc<dyn SnapshotStore>,
        retention: RetentionPolicy,
        average_latency_ms: f64,
    ) -> Self {
        Self {
            roster,
            source,
            store,
            retention,
            average_latency_ms,
            phase: new_state(SyncPhase::Idle),
            cycles_completed: AtomicU64::new(0),
            cycles_failed: AtomicU64::new(0),
        }
    }

    pub fn roster(&self) -> &[String] {
        &self.roster
    }

    pub fn on_roster(&self, address: &str) -> bool {
        self.roster.iter().any(|a| a == address)
    }

    pub fn phase(&self) -> SyncPhase {
        snapshot(&self.phase)
    }

    pub fn cycles_completed(&self) -> u64 {
        self.cycles_completed.load(Ordering::Relaxed)
    }

    pub fn cycles_failed(&self) -> u64 {
        self.cycles_failed.load(Ordering::Relaxed)
    }

    /// Runs one cycle inside its own tracing span.
    pub async fn run_cycle(&self) -> Result<SyncOutcome, SyncError> {
        let cycle_id = Uuid::new_v4();
        self.run_cycle_inner()
            .instrument(info_span!("sync_cycle", %cycle_id))
            .await
    }

    async fn run_cycle_inner(&self) -> Result<SyncOutcome, SyncError> {
        let clock = Instant::now();
        let queried = u32::try_from(self.roster.len()).unwrap_or(u32::MAX);
        *self.phase.lock() = SyncPhase::Running;

        let log_id = match self.store.create_sync_log(queried, OffsetDateTime::now_utc()).await {
            Ok(id) => id,
            Err(e) => {
                error!(error = %e, "could not open sync log, cycle aborted");
                self.finish(false);
                return Err(SyncError::SyncLogCreation(e));
            }
        };
        info!(%log_id, nodes = queried, "sync cycle started");

        let collection = collect(Arc::clone(&self.source), &self.roster).await;
        let (readings, rejected) = storable_readings(collection.successes);
        let succeeded = u32::try_from(readings.len()).unwrap_or(u32::MAX);
        let failed = u32::try_from(collection.failed + rejected).unwrap_or(u32::MAX);

        let persisted = self.persist(&readings).await;
        let duration_ms = elapsed_ms(clock);

        let mut outcome = match persisted {
            Ok(()) => SyncOutcome {
                success: true,
                nodes_queried: queried,
                nodes_success: succeeded,
                nodes_failed: failed,
                duration_ms,
                error: None,
            },
            Err(e) => {
                error!(%log_id, error = %e, "snapshot write failed");
                failure(queried, duration_ms, e.to_string())
            }
        };

        if let Err(e) = self.store.complete_sync_log(log_id, &completion(&outcome)).await {
            error!(%log_id, error = %e, "could not complete sync log");
            if outcome.success {
                outcome = failure(queried, duration_ms, e.to_string());
                self.record_failure(log_id, &outcome).await;
            }
        }

        self.finish(outcome.success);
        info!(
            %log_id,
            success = outcome.success,
            nodes_success = outcome.nodes_success,
            nodes_failed = outcome.nodes_failed,
            duration_ms = outcome.duration_ms,
            "sync cycle finished"
        );
        Ok(outcome)
    }

    /// Writes node rows, then the network row, all stamped with one timestamp.
    async fn persist(&self, readings: &[NodeReading]) -> Result<(), StoreError> {
        if readings.is_empty() {
            info!("no pnode answered, nothing to store");
            return Ok(());
        }
        let created_at = OffsetDateTime::now_utc();
        let nodes: Vec<NodeSnapshot> = readings.iter().map(|r| node_snapshot(r, created_at)).collect();
        self.store.append_node_snapshots(&nodes).await?;
        let network = aggregate(readings, self.roster.len(), self.average_latency_ms, created_at);
        self.store.append_network_snapshot(&network).await
    }

    async fn record_failure(&self, log_id: SyncLogId, outcome: &SyncOutcome) {
        if let Err(e) = self.store.complete_sync_log(log_id, &completion(outcome)).await {
            warn!(%log_id, error = %e, "sync log left open");
        }
    }

    fn finish(&self, success: bool) {
        if success {
            self.cycles_completed.fetch_add(1, Ordering::Relaxed);
            *self.phase.lock() = SyncPhase::Completed;
        } else {
            self.cycles_failed.fetch_add(1, Ordering::Relaxed);
            *self.phase.lock() = SyncPhase::Failed;
        }
    }

    /// A cycle followed by the retention sweep.
    pub async fn trigger(&self) -> Result<SyncReport, SyncError> {
        let sync = self.run_cycle().await?;
        let (cleanup, cleanup_error) =
            match self.retention.sweep(self.store.as_ref(), OffsetDateTime::now_utc()).await {
                Ok(report) => (Some(report), None),
                Err(e) => {
                    error!(error = %e, "retention sweep failed");
                    (None, Some(e.to_string()))
                }
            };
        Ok(SyncReport {
            success: sync.success && cleanup_error.is_none(),
            sync,
            cleanup,
            cleanup_error,
            timestamp: OffsetDateTime::now_utc(),
        })
    }

    pub async fn status(&self) -> Result<SyncStatus, StoreError> {
        Ok(SyncStatus {
            last_sync: self.store.latest_sync_log().await?,
            snapshot_counts: self.store.snapshot_counts().await?,
        })
    }

    pub async fn latest_nodes(&self) -> Result<Vec<NodeSnapshot>, StoreError> {
        self.store.latest_node_snapshots().await
    }

    pub async fn latest_network(&self) -> Result<Option<NetworkSnapshot>, StoreError> {
        self.store.latest_network_snapshot().await
    }

    pub async fn probe(&self, address: &str) -> Result<NodeStats, ProbeError> {
        self.source.fetch_stats(address).await
    }

    pub async fn probe_all(&self) -> LiveRoster {
        let collection = collect(Arc::clone(&self.source), &self.roster).await;
        LiveRoster {
            total_nodes: self.roster.len(),
            active_nodes: collection.successes.len(),
            nodes: collection.successes,
        }
    }
}

/// Drops readings the store cannot hold; each one counts as a failed node.
fn storable_readings(successes: Vec<NodeReading>) -> (Vec<NodeReading>, usize) {
    let total = successes.len();
    let kept: Vec<NodeReading> = successes
        .into_iter()
        .filter(|reading| match unstorable_field(&reading.stats) {
            Some(field) => {
                warn!(address = %reading.ip, field, "pnode reported an out-of-range counter");
                false
            }
            None => true,
        })
        .collect();
    let rejected = total - kept.len();
    (kept, rejected)
}

fn elapsed_ms(clock: Instant) -> u64 {
    u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn failure(queried: u32, duration_ms: u64, error: String) -> SyncOutcome {
    SyncOutcome {
        success: false,
        nodes_queried: queried,
        nodes_success: 0,
        nodes_failed: queried,
        duration_ms,
        error: Some(error),
    }
}

fn completion(outcome: &SyncOutcome) -> SyncCompletion {
    SyncCompletion {
        completed_at: OffsetDateTime::now_utc(),
        nodes_success: outcome.nodes_success,
        nodes_failed: outcome.nodes_failed,
        duration_ms: outcome.duration_ms,
        error: outcome.error.clone(),
    }
}

/// Triggers a sync on a fixed period. The first tick fires immediately.
pub fn spawn_sync_scheduler(service: Arc<SyncService>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(every_secs = every.as_secs(), "sync scheduler started");
        loop {
            interval.tick().await;
            if let Err(e) = service.trigger().await {
                error!(error = %e, "scheduled sync failed");
            }
        }
    })
}
