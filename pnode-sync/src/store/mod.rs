/**
 * SNAPSHOT STORE - persistence seam for the sync service
 *
 * ROLE:
 * Append-only storage of pNode snapshots, network snapshots and sync logs,
 * with "latest" reads for the dashboard and time-bounded deletion for the
 * retention sweep.
 *
 * BACKENDS:
 * - `SqliteStore` : relational backend (rusqlite, bundled SQLite)
 * - `MemoryStore` : in-process tables, for tests and throwaway deployments
 * The backend is picked once at startup by `open_store`.
 *
 * GUARANTEES:
 * - a sync log is completed at most once (`AlreadyCompleted` otherwise)
 * - rows of one cycle share one `created_at`; "latest" means that group
 * - counters are stored as 64-bit integers, never as floats
 */

pub mod memory;
pub mod sqlite;

use crate::config::{StoreBackend, StoreConf};
use crate::models::{
    NetworkSnapshot, NodeSnapshot, RetentionReport, SnapshotCounts, SyncCompletion, SyncLog,
    SyncLogId,
};
use async_trait::async_trait;
use std::sync::Arc;
use time::OffsetDateTime;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("value {value} does not fit column {column}")]
    OutOfRange { column: &'static str, value: u64 },
    #[error("timestamp out of range for column {column}")]
    Timestamp { column: &'static str },
    #[error("sync log {0} not found")]
    UnknownSyncLog(SyncLogId),
    #[error("sync log {0} already completed")]
    AlreadyCompleted(SyncLogId),
    #[error("rejected write: {0}")]
    Rejected(String),
    #[error("store worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Operations the orchestrator and the read endpoints need from persistence.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Inserts one row per snapshot; returns how many were written.
    async fn append_node_snapshots(&self, batch: &[NodeSnapshot]) -> Result<usize, StoreError>;

    async fn append_network_snapshot(&self, snapshot: &NetworkSnapshot) -> Result<(), StoreError>;

    async fn create_sync_log(
        &self,
        nodes_queried: u32,
        started_at: OffsetDateTime,
    ) -> Result<SyncLogId, StoreError>;

    /// Fills the completion fields. Fails if the log is unknown or already completed.
    async fn complete_sync_log(
        &self,
        id: SyncLogId,
        completion: &SyncCompletion,
    ) -> Result<(), StoreError>;

    /// Rows sharing the newest `created_at`, highest uptime first.
    async fn latest_node_snapshots(&self) -> Result<Vec<NodeSnapshot>, StoreError>;

    async fn latest_network_snapshot(&self) -> Result<Option<NetworkSnapshot>, StoreError>;

    /// Most recently started sync log.
    async fn latest_sync_log(&self) -> Result<Option<SyncLog>, StoreError>;

    async fn snapshot_counts(&self) -> Result<SnapshotCounts, StoreError>;

    /// Deletes snapshots created, and sync logs started, strictly before `cutoff`.
    async fn delete_older_than(&self, cutoff: OffsetDateTime) -> Result<RetentionReport, StoreError>;
}

/// Builds the configured backend.
pub fn open_store(conf: &StoreConf) -> Result<Arc<dyn SnapshotStore>, StoreError> {
    match conf.backend {
        StoreBackend::Sqlite => Ok(Arc::new(SqliteStore::open(&conf.path)?)),
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
    }
}

/// Shared invariant check applied by every backend before inserting.
pub(crate) fn check_network_snapshot(snapshot: &NetworkSnapshot) -> Result<(), StoreError> {
    if snapshot.active_pnodes > snapshot.total_pnodes {
        return Err(StoreError::Rejected(format!(
            "active pnodes ({}) exceed roster size ({})",
            snapshot.active_pnodes, snapshot.total_pnodes
        )));
    }
    if snapshot.used_storage > snapshot.total_storage {
        return Err(StoreError::Rejected(format!(
            "used storage ({}) exceeds total storage ({})",
            snapshot.used_storage, snapshot.total_storage
        )));
    }
    Ok(())
}
