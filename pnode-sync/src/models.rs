//! Data model shared by the pRPC client, the aggregator, the stores and the API.
//!
//! HTTP-facing structs keep the camelCase field names the dashboard already
//! consumes; `NodeStats` keeps the snake_case names of the pRPC wire contract.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Statistics payload returned by a pNode for the `get-stats` method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStats {
    pub active_streams: u64,
    pub cpu_percent: f64,
    pub current_index: u64,
    /// bytes
    pub file_size: u64,
    /// unix seconds, as reported by the node
    pub last_updated: u64,
    pub packets_received: u64,
    pub packets_sent: u64,
    pub ram_total: u64,
    pub ram_used: u64,
    pub total_bytes: u64,
    pub total_pages: u64,
    /// seconds
    pub uptime: u64,
}

/// One successful poll: which roster address answered and what it said.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeReading {
    pub ip: String,
    pub stats: NodeStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Active,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Active => "active",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "active" => Some(NodeStatus::Active),
            _ => None,
        }
    }
}

/// Point-in-time record of one pNode, written once per successful poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSnapshot {
    pub ip_address: String,
    pub status: NodeStatus,
    pub file_size: u64,
    pub storage_used: u64,
    pub storage_capacity: u64,
    pub cpu_percent: f64,
    pub ram_used: u64,
    pub ram_total: u64,
    pub uptime_seconds: u64,
    pub active_streams: u64,
    pub packets_received: u64,
    pub packets_sent: u64,
    pub region: String,
    pub last_updated: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Network-wide aggregate, written once per cycle with at least one success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSnapshot {
    #[serde(rename = "totalPNodes")]
    pub total_pnodes: u32,
    #[serde(rename = "activePNodes")]
    pub active_pnodes: u32,
    pub total_storage: u64,
    pub used_storage: u64,
    pub total_shards: u64,
    pub available_shards: u64,
    pub average_uptime: f64,
    pub average_latency: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Handle on a sync log row, returned at cycle start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncLogId(pub i64);

impl std::fmt::Display for SyncLogId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Bookkeeping for one sync cycle invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncLog {
    pub id: SyncLogId,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    pub nodes_queried: u32,
    pub nodes_success: u32,
    pub nodes_failed: u32,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
}

impl SyncLog {
    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }
}

/// Fields written by the single completion update of a sync log.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncCompletion {
    pub completed_at: OffsetDateTime,
    pub nodes_success: u32,
    pub nodes_failed: u32,
    pub duration_ms: u64,
    pub error: Option<String>,
}

/// Structured result of one sync cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    pub success: bool,
    pub nodes_queried: u32,
    pub nodes_success: u32,
    pub nodes_failed: u32,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-table deletion counts of one retention sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionReport {
    #[serde(rename = "deletedPNodes")]
    pub deleted_pnodes: u64,
    #[serde(rename = "deletedNetworkStats")]
    pub deleted_network_stats: u64,
    #[serde(rename = "deletedSyncLogs")]
    pub deleted_sync_logs: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotCounts {
    pub pnodes: u64,
    pub network_stats: u64,
}

/// Most recent sync log plus table sizes, served by `GET /sync`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub last_sync: Option<SyncLog>,
    pub snapshot_counts: SnapshotCounts,
}
