//! SQLite backend.
//!
//! One connection behind a mutex; every call runs on the blocking pool.
//! Timestamps are stored as unix nanoseconds so a cycle's rows compare equal.

use super::{check_network_snapshot, SnapshotStore, StoreError};
use crate::models::{
    NetworkSnapshot, NodeSnapshot, NodeStatus, RetentionReport, SnapshotCounts, SyncCompletion,
    SyncLog, SyncLogId,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::info;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS pnode_snapshots (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    ip_address       TEXT    NOT NULL,
    status           TEXT    NOT NULL,
    file_size        INTEGER NOT NULL,
    storage_used     INTEGER NOT NULL,
    storage_capacity INTEGER NOT NULL,
    cpu_percent      REAL    NOT NULL,
    ram_used         INTEGER NOT NULL,
    ram_total        INTEGER NOT NULL,
    uptime_seconds   INTEGER NOT NULL,
    active_streams   INTEGER NOT NULL,
    packets_received INTEGER NOT NULL,
    packets_sent     INTEGER NOT NULL,
    region           TEXT    NOT NULL,
    last_updated     INTEGER NOT NULL,
    created_at       INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS pnode_snapshots_created_at ON pnode_snapshots (created_at);

CREATE TABLE IF NOT EXISTS network_stats_snapshots (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    total_pnodes     INTEGER NOT NULL,
    active_pnodes    INTEGER NOT NULL,
    total_storage    INTEGER NOT NULL,
    used_storage     INTEGER NOT NULL,
    total_shards     INTEGER NOT NULL,
    available_shards INTEGER NOT NULL,
    average_uptime   REAL    NOT NULL,
    average_latency  REAL    NOT NULL,
    created_at       INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS network_stats_snapshots_created_at ON network_stats_snapshots (created_at);

CREATE TABLE IF NOT EXISTS sync_logs (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    started_at    INTEGER NOT NULL,
    completed_at  INTEGER,
    nodes_queried INTEGER NOT NULL,
    nodes_success INTEGER NOT NULL DEFAULT 0,
    nodes_failed  INTEGER NOT NULL DEFAULT 0,
    duration_ms   INTEGER,
    error         TEXT
);
CREATE INDEX IF NOT EXISTS sync_logs_started_at ON sync_logs (started_at);
";

const NODE_COLUMNS: &str = "ip_address, status, file_size, storage_used, storage_capacity, \
    cpu_percent, ram_used, ram_total, uptime_seconds, active_streams, packets_received, \
    packets_sent, region, last_updated, created_at";

const NETWORK_COLUMNS: &str = "total_pnodes, active_pnodes, total_storage, used_storage, \
    total_shards, available_shards, average_uptime, average_latency, created_at";

const LOG_COLUMNS: &str =
    "id, started_at, completed_at, nodes_queried, nodes_success, nodes_failed, duration_ms, error";

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Opens (or creates) the database file and its parent directory.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let store = Self::init(Connection::open(path)?)?;
        info!(path = %path.display(), "sqlite snapshot store ready");
        Ok(store)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || f(&mut conn.lock())).await?
    }
}

fn to_sql_int(column: &'static str, value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::OutOfRange { column, value })
}

fn to_sql_time(column: &'static str, at: OffsetDateTime) -> Result<i64, StoreError> {
    i64::try_from(at.unix_timestamp_nanos()).map_err(|_| StoreError::Timestamp { column })
}

/// Cutoffs before the representable range delete nothing rather than fail.
fn to_sql_cutoff(at: OffsetDateTime) -> i64 {
    at.unix_timestamp_nanos().clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64
}

fn col_u64(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let raw: i64 = row.get(idx)?;
    u64::try_from(raw).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(idx, raw))
}

fn col_u32(row: &Row<'_>, idx: usize) -> rusqlite::Result<u32> {
    let raw: i64 = row.get(idx)?;
    u32::try_from(raw).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(idx, raw))
}

fn col_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<OffsetDateTime> {
    let raw: i64 = row.get(idx)?;
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(raw))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Integer, Box::new(e)))
}

fn col_opt_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<OffsetDateTime>> {
    match row.get::<_, Option<i64>>(idx)? {
        Some(_) => col_time(row, idx).map(Some),
        None => Ok(None),
    }
}

fn read_node(row: &Row<'_>) -> rusqlite::Result<NodeSnapshot> {
    let status: String = row.get(1)?;
    let status = NodeStatus::parse(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(1, Type::Text, format!("unknown status {status}").into())
    })?;
    Ok(NodeSnapshot {
        ip_address: row.get(0)?,
        status,
        file_size: col_u64(row, 2)?,
        storage_used: col_u64(row, 3)?,
        storage_capacity: col_u64(row, 4)?,
        cpu_percent: row.get(5)?,
        ram_used: col_u64(row, 6)?,
        ram_total: col_u64(row, 7)?,
        uptime_seconds: col_u64(row, 8)?,
        active_streams: col_u64(row, 9)?,
        packets_received: col_u64(row, 10)?,
        packets_sent: col_u64(row, 11)?,
        region: row.get(12)?,
        last_updated: col_u64(row, 13)?,
        created_at: col_time(row, 14)?,
    })
}

fn read_network(row: &Row<'_>) -> rusqlite::Result<NetworkSnapshot> {
    Ok(NetworkSnapshot {
        total_pnodes: col_u32(row, 0)?,
        active_pnodes: col_u32(row, 1)?,
        total_storage: col_u64(row, 2)?,
        used_storage: col_u64(row, 3)?,
        total_shards: col_u64(row, 4)?,
        available_shards: col_u64(row, 5)?,
        average_uptime: row.get(6)?,
        average_latency: row.get(7)?,
        created_at: col_time(row, 8)?,
    })
}

fn read_log(row: &Row<'_>) -> rusqlite::Result<SyncLog> {
    let duration_ms = match row.get::<_, Option<i64>>(6)? {
        Some(raw) => Some(u64::try_from(raw).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(6, raw))?),
        None => None,
    };
    Ok(SyncLog {
        id: SyncLogId(row.get(0)?),
        started_at: col_time(row, 1)?,
        completed_at: col_opt_time(row, 2)?,
        nodes_queried: col_u32(row, 3)?,
        nodes_success: col_u32(row, 4)?,
        nodes_failed: col_u32(row, 5)?,
        duration_ms,
        error: row.get(7)?,
    })
}

fn count_rows(conn: &Connection, table: &str) -> Result<u64, StoreError> {
    let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
    Ok(u64::try_from(n).unwrap_or(0))
}

fn deleted(n: usize) -> u64 {
    u64::try_from(n).unwrap_or(u64::MAX)
}

#[async_trait]
impl SnapshotStore for SqliteStore {
    async fn append_node_snapshots(&self, batch: &[NodeSnapshot]) -> Result<usize, StoreError> {
        let batch = batch.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(&format!(
                    "INSERT INTO pnode_snapshots ({NODE_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
                ))?;
                for n in &batch {
                    stmt.execute(params![
                        n.ip_address,
                        n.status.as_str(),
                        to_sql_int("file_size", n.file_size)?,
                        to_sql_int("storage_used", n.storage_used)?,
                        to_sql_int("storage_capacity", n.storage_capacity)?,
                        n.cpu_percent,
                        to_sql_int("ram_used", n.ram_used)?,
                        to_sql_int("ram_total", n.ram_total)?,
                        to_sql_int("uptime_seconds", n.uptime_seconds)?,
                        to_sql_int("active_streams", n.active_streams)?,
                        to_sql_int("packets_received", n.packets_received)?,
                        to_sql_int("packets_sent", n.packets_sent)?,
                        n.region,
                        to_sql_int("last_updated", n.last_updated)?,
                        to_sql_time("created_at", n.created_at)?,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(batch.len())
        })
        .await
    }

    async fn append_network_snapshot(&self, snapshot: &NetworkSnapshot) -> Result<(), StoreError> {
        check_network_snapshot(snapshot)?;
        let s = snapshot.clone();
        self.with_conn(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO network_stats_snapshots ({NETWORK_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
                ),
                params![
                    s.total_pnodes,
                    s.active_pnodes,
                    to_sql_int("total_storage", s.total_storage)?,
                    to_sql_int("used_storage", s.used_storage)?,
                    to_sql_int("total_shards", s.total_shards)?,
                    to_sql_int("available_shards", s.available_shards)?,
                    s.average_uptime,
                    s.average_latency,
                    to_sql_time("created_at", s.created_at)?,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn create_sync_log(
        &self,
        nodes_queried: u32,
        started_at: OffsetDateTime,
    ) -> Result<SyncLogId, StoreError> {
        let started = to_sql_time("started_at", started_at)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO sync_logs (started_at, nodes_queried) VALUES (?1, ?2)",
                params![started, nodes_queried],
            )?;
            Ok(SyncLogId(conn.last_insert_rowid()))
        })
        .await
    }

    async fn complete_sync_log(
        &self,
        id: SyncLogId,
        completion: &SyncCompletion,
    ) -> Result<(), StoreError> {
        let completed_at = to_sql_time("completed_at", completion.completed_at)?;
        let duration_ms = to_sql_int("duration_ms", completion.duration_ms)?;
        let c = completion.clone();
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE sync_logs \
                 SET completed_at = ?2, nodes_success = ?3, nodes_failed = ?4, duration_ms = ?5, error = ?6 \
                 WHERE id = ?1 AND completed_at IS NULL",
                params![id.0, completed_at, c.nodes_success, c.nodes_failed, duration_ms, c.error],
            )?;
            if updated == 1 {
                return Ok(());
            }
            let exists = conn
                .query_row("SELECT 1 FROM sync_logs WHERE id = ?1", [id.0], |_| Ok(()))
                .optional()?
                .is_some();
            Err(if exists { StoreError::AlreadyCompleted(id) } else { StoreError::UnknownSyncLog(id) })
        })
        .await
    }

    async fn latest_node_snapshots(&self) -> Result<Vec<NodeSnapshot>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {NODE_COLUMNS} FROM pnode_snapshots \
                 WHERE created_at = (SELECT MAX(created_at) FROM pnode_snapshots) \
                 ORDER BY uptime_seconds DESC, id ASC"
            ))?;
            let rows = stmt.query_map([], read_node)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn latest_network_snapshot(&self) -> Result<Option<NetworkSnapshot>, StoreError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {NETWORK_COLUMNS} FROM network_stats_snapshots \
                         ORDER BY created_at DESC, id DESC LIMIT 1"
                    ),
                    [],
                    read_network,
                )
                .optional()?)
        })
        .await
    }

    async fn latest_sync_log(&self) -> Result<Option<SyncLog>, StoreError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {LOG_COLUMNS} FROM sync_logs ORDER BY started_at DESC, id DESC LIMIT 1"),
                    [],
                    read_log,
                )
                .optional()?)
        })
        .await
    }

    async fn snapshot_counts(&self) -> Result<SnapshotCounts, StoreError> {
        self.with_conn(|conn| {
            Ok(SnapshotCounts {
                pnodes: count_rows(conn, "pnode_snapshots")?,
                network_stats: count_rows(conn, "network_stats_snapshots")?,
            })
        })
        .await
    }

    async fn delete_older_than(&self, cutoff: OffsetDateTime) -> Result<RetentionReport, StoreError> {
        let cutoff = to_sql_cutoff(cutoff);
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let report = RetentionReport {
                deleted_pnodes: deleted(
                    tx.execute("DELETE FROM pnode_snapshots WHERE created_at < ?1", [cutoff])?,
                ),
                deleted_network_stats: deleted(
                    tx.execute("DELETE FROM network_stats_snapshots WHERE created_at < ?1", [cutoff])?,
                ),
                deleted_sync_logs: deleted(
                    tx.execute("DELETE FROM sync_logs WHERE started_at < ?1", [cutoff])?,
                ),
            };
            tx.commit()?;
            Ok(report)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::contract;

    #[tokio::test]
    async fn test_empty_store_reads() {
        contract::empty_store_reads(&SqliteStore::open_in_memory().unwrap()).await;
    }

    #[tokio::test]
    async fn test_latest_group_only() {
        contract::latest_group_only(&SqliteStore::open_in_memory().unwrap()).await;
    }

    #[tokio::test]
    async fn test_sync_log_lifecycle() {
        contract::sync_log_lifecycle(&SqliteStore::open_in_memory().unwrap()).await;
    }

    #[tokio::test]
    async fn test_retention_cutoff() {
        contract::retention_cutoff(&SqliteStore::open_in_memory().unwrap()).await;
    }

    #[tokio::test]
    async fn test_rejects_inconsistent_network() {
        contract::rejects_inconsistent_network(&SqliteStore::open_in_memory().unwrap()).await;
    }

    #[tokio::test]
    async fn test_counter_past_i64_is_rejected() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut node = contract::node("a", 1, OffsetDateTime::now_utc());
        node.packets_sent = u64::MAX;
        let err = store.append_node_snapshots(&[node]).await.unwrap_err();
        assert!(matches!(err, StoreError::OutOfRange { column: "packets_sent", .. }));
        assert_eq!(store.snapshot_counts().await.unwrap().pnodes, 0);
    }

    #[tokio::test]
    async fn test_counter_past_f64_mantissa_round_trips() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut node = contract::node("a", 1, OffsetDateTime::now_utc());
        node.packets_received = (1u64 << 53) + 1;
        store.append_node_snapshots(&[node.clone()]).await.unwrap();
        let latest = store.latest_node_snapshots().await.unwrap();
        assert_eq!(latest[0].packets_received, (1u64 << 53) + 1);
    }

    #[tokio::test]
    async fn test_cutoff_before_stored_range_deletes_nothing() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.append_node_snapshots(&[contract::node("a", 1, OffsetDateTime::now_utc())]).await.unwrap();
        let earliest = time::PrimitiveDateTime::MIN.assume_utc();
        assert_eq!(store.delete_older_than(earliest).await.unwrap(), RetentionReport::default());
        assert_eq!(store.snapshot_counts().await.unwrap().pnodes, 1);
    }

    #[tokio::test]
    async fn test_data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.db");
        let at = OffsetDateTime::now_utc();
        {
            let store = SqliteStore::open(&path).unwrap();
            store.append_node_snapshots(&[contract::node("a", 5, at)]).await.unwrap();
            store.append_network_snapshot(&contract::network(at)).await.unwrap();
        }
        let reopened = SqliteStore::open(&path).unwrap();
        assert_eq!(reopened.latest_node_snapshots().await.unwrap(), vec![contract::node("a", 5, at)]);
        assert_eq!(reopened.latest_network_snapshot().await.unwrap(), Some(contract::network(at)));
    }
}
