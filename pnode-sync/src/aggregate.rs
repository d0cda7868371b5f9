//! Network-wide aggregation and per-node derived fields.
//!
//! Byte and shard math stays in integers (u128 intermediates) so counters past
//! 2^53 keep full precision; only the uptime percentage is floating point.

use crate::models::{NetworkSnapshot, NodeReading, NodeSnapshot, NodeStats, NodeStatus};
use time::OffsetDateTime;

pub const SHARD_SIZE_BYTES: u64 = 10 * 1024 * 1024;
/// Capacity estimate = usage × 13/10.
const HEADROOM: (u64, u64) = (13, 10);
/// Available shards = total × 98/100.
const SHARD_AVAILABILITY: (u64, u64) = (98, 100);
pub const MAX_UPTIME_PERCENT: f64 = 99.99;
const SECONDS_PER_DAY: f64 = 86_400.0;

/// `round(value × num / den)`, half away from zero.
fn scale_rounded(value: u64, (num, den): (u64, u64)) -> u64 {
    let scaled = (u128::from(value) * u128::from(num) + u128::from(den / 2)) / u128::from(den);
    u64::try_from(scaled).unwrap_or(u64::MAX)
}

pub fn storage_capacity(used_bytes: u64) -> u64 {
    scale_rounded(used_bytes, HEADROOM)
}

pub fn shard_count(used_bytes: u64) -> u64 {
    used_bytes / SHARD_SIZE_BYTES
}

pub fn available_shards(total_shards: u64) -> u64 {
    scale_rounded(total_shards, SHARD_AVAILABILITY)
}

/// Maps raw uptime seconds onto the dashboard's uptime percentage.
pub fn uptime_percent(uptime_seconds: u64) -> f64 {
    (95.0 + uptime_seconds as f64 / SECONDS_PER_DAY * 0.5).min(MAX_UPTIME_PERCENT)
}

/// Rough region from the first IPv4 octet. Arms are checked in order, so the
/// `>= 173` arm only sees addresses above 223.
pub fn estimate_region(address: &str) -> &'static str {
    let Some(first) = address.split('.').next().and_then(|o| o.parse::<u16>().ok()) else {
        return "Unknown";
    };
    match first {
        192..=223 => "US East",
        161..=191 => "EU West",
        173.. => "EU Central",
        _ => "Unknown",
    }
}

/// Largest counter the snapshot tables hold (signed 64-bit columns).
pub const MAX_STORED_COUNTER: u64 = i64::MAX as u64;

/// Names the first field that cannot be stored as reported, derived capacity included.
pub fn unstorable_field(stats: &NodeStats) -> Option<&'static str> {
    [
        ("file_size", stats.file_size),
        ("storage_capacity", storage_capacity(stats.file_size)),
        ("ram_used", stats.ram_used),
        ("ram_total", stats.ram_total),
        ("uptime", stats.uptime),
        ("active_streams", stats.active_streams),
        ("packets_received", stats.packets_received),
        ("packets_sent", stats.packets_sent),
        ("last_updated", stats.last_updated),
    ]
    .into_iter()
    .find(|(_, value)| *value > MAX_STORED_COUNTER)
    .map(|(field, _)| field)
}

pub fn node_snapshot(reading: &NodeReading, created_at: OffsetDateTime) -> NodeSnapshot {
    let stats = &reading.stats;
    NodeSnapshot {
        ip_address: reading.ip.clone(),
        status: NodeStatus::Active,
        file_size: stats.file_size,
        storage_used: stats.file_size,
        storage_capacity: storage_capacity(stats.file_size),
        cpu_percent: stats.cpu_percent,
        ram_used: stats.ram_used,
        ram_total: stats.ram_total,
        uptime_seconds: stats.uptime,
        active_streams: stats.active_streams,
        packets_received: stats.packets_received,
        packets_sent: stats.packets_sent,
        region: estimate_region(&reading.ip).to_string(),
        last_updated: stats.last_updated,
        created_at,
    }
}

/// Builds the network snapshot for one cycle. Zero readings give all-zero
/// aggregates rather than NaN.
pub fn aggregate(
    readings: &[NodeReading],
    roster_size: usize,
    average_latency_ms: f64,
    created_at: OffsetDateTime,
) -> NetworkSnapshot {
    let used_storage = readings
        .iter()
        .fold(0u64, |sum, r| sum.saturating_add(r.stats.file_size));
    let total_shards = readings
        .iter()
        .fold(0u64, |sum, r| sum.saturating_add(shard_count(r.stats.file_size)));
    let average_uptime = if readings.is_empty() {
        0.0
    } else {
        readings.iter().map(|r| uptime_percent(r.stats.uptime)).sum::<f64>() / readings.len() as f64
    };

    NetworkSnapshot {
        total_pnodes: u32::try_from(roster_size).unwrap_or(u32::MAX),
        active_pnodes: u32::try_from(readings.len()).unwrap_or(u32::MAX),
        total_storage: storage_capacity(used_storage),
        used_storage,
        total_shards,
        available_shards: available_shards(total_shards),
        average_uptime,
        average_latency: if readings.is_empty() { 0.0 } else { average_latency_ms },
        created_at,
    }
}
