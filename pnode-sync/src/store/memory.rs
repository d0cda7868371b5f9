//! In-process snapshot tables guarded by a single lock.
//!
//! Nothing survives a restart; use the SQLite backend for real deployments.

use super::{check_network_snapshot, SnapshotStore, StoreError};
use crate::models::{
    NetworkSnapshot, NodeSnapshot, RetentionReport, SnapshotCounts, SyncCompletion, SyncLog,
    SyncLogId,
};
use crate::state::{new_state, Shared};
use async_trait::async_trait;
use time::OffsetDateTime;

#[derive(Debug, Default)]
struct Tables {
    nodes: Vec<NodeSnapshot>,
    networks: Vec<NetworkSnapshot>,
    logs: Vec<SyncLog>,
    next_log_id: i64,
}

#[derive(Debug, Clone)]
pub struct MemoryStore {
    tables: Shared<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self { tables: new_state(Tables { next_log_id: 1, ..Tables::default() }) }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn count(len: usize) -> u64 {
    u64::try_from(len).unwrap_or(u64::MAX)
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn append_node_snapshots(&self, batch: &[NodeSnapshot]) -> Result<usize, StoreError> {
        self.tables.lock().nodes.extend_from_slice(batch);
        Ok(batch.len())
    }

    async fn append_network_snapshot(&self, snapshot: &NetworkSnapshot) -> Result<(), StoreError> {
        check_network_snapshot(snapshot)?;
        self.tables.lock().networks.push(snapshot.clone());
        Ok(())
    }

    async fn create_sync_log(
        &self,
        nodes_queried: u32,
        started_at: OffsetDateTime,
    ) -> Result<SyncLogId, StoreError> {
        let mut tables = self.tables.lock();
        let id = SyncLogId(tables.next_log_id);
        tables.next_log_id += 1;
        tables.logs.push(SyncLog {
            id,
            started_at,
            completed_at: None,
            nodes_queried,
            nodes_success: 0,
            nodes_failed: 0,
            duration_ms: None,
            error: None,
        });
        Ok(id)
    }

    async fn complete_sync_log(
        &self,
        id: SyncLogId,
        completion: &SyncCompletion,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        let log = tables
            .logs
            .iter_mut()
            .find(|log| log.id == id)
            .ok_or(StoreError::UnknownSyncLog(id))?;
        if log.is_completed() {
            return Err(StoreError::AlreadyCompleted(id));
        }
        log.completed_at = Some(completion.completed_at);
        log.nodes_success = completion.nodes_success;
        log.nodes_failed = completion.nodes_failed;
        log.duration_ms = Some(completion.duration_ms);
        log.error = completion.error.clone();
        Ok(())
    }

    async fn latest_node_snapshots(&self) -> Result<Vec<NodeSnapshot>, StoreError> {
        let tables = self.tables.lock();
        let Some(newest) = tables.nodes.iter().map(|n| n.created_at).max() else {
            return Ok(Vec::new());
        };
        let mut group: Vec<NodeSnapshot> =
            tables.nodes.iter().filter(|n| n.created_at == newest).cloned().collect();
        // stable sort keeps insertion order among equal uptimes
        group.sort_by(|a, b| b.uptime_seconds.cmp(&a.uptime_seconds));
        Ok(group)
    }

    async fn latest_network_snapshot(&self) -> Result<Option<NetworkSnapshot>, StoreError> {
        let tables = self.tables.lock();
        // on equal timestamps the later insert wins, like `ORDER BY created_at DESC, id DESC`
        Ok(tables
            .networks
            .iter()
            .enumerate()
            .max_by_key(|(i, n)| (n.created_at, *i))
            .map(|(_, n)| n.clone()))
    }

    async fn latest_sync_log(&self) -> Result<Option<SyncLog>, StoreError> {
        let tables = self.tables.lock();
        Ok(tables.logs.iter().max_by_key(|log| (log.started_at, log.id.0)).cloned())
    }

    async fn snapshot_counts(&self) -> Result<SnapshotCounts, StoreError> {
        let tables = self.tables.lock();
        Ok(SnapshotCounts { pnodes: count(tables.nodes.len()), network_stats: count(tables.networks.len()) })
    }

    async fn delete_older_than(&self, cutoff: OffsetDateTime) -> Result<RetentionReport, StoreError> {
        let mut tables = self.tables.lock();
        let before = (tables.nodes.len(), tables.networks.len(), tables.logs.len());
        tables.nodes.retain(|n| n.created_at >= cutoff);
        tables.networks.retain(|n| n.created_at >= cutoff);
        tables.logs.retain(|log| log.started_at >= cutoff);
        Ok(RetentionReport {
            deleted_pnodes: count(before.0 - tables.nodes.len()),
            deleted_network_stats: count(before.1 - tables.networks.len()),
            deleted_sync_logs: count(before.2 - tables.logs.len()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::contract;

    #[tokio::test]
    async fn test_empty_store_reads() {
        contract::empty_store_reads(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_latest_group_only() {
        contract::latest_group_only(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_sync_log_lifecycle() {
        contract::sync_log_lifecycle(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_retention_cutoff() {
        contract::retention_cutoff(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_rejects_inconsistent_network() {
        contract::rejects_inconsistent_network(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_clones_share_tables() {
        let store = MemoryStore::new();
        let other = store.clone();
        other
            .append_node_snapshots(&[contract::node("a", 1, OffsetDateTime::now_utc())])
            .await
            .unwrap();
        assert_eq!(store.snapshot_counts().await.unwrap().pnodes, 1);
    }
}
