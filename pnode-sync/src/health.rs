use crate::sync::{SyncPhase, SyncService};
use serde::{Deserialize, Serialize};
use std::time::Instant;

#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub uptime_seconds: u64,
    pub roster_size: u32,
    pub sync_phase: SyncPhase,
    pub cycles_completed: u64,
    pub cycles_failed: u64,
    pub memory_usage_mb: f32,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self { start_time: Instant::now() }
    }

    pub fn get_health(&self, sync: &SyncService) -> ServiceHealth {
        ServiceHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            roster_size: u32::try_from(sync.roster().len()).unwrap_or(u32::MAX),
            sync_phase: sync.phase(),
            cycles_completed: sync.cycles_completed(),
            cycles_failed: sync.cycles_failed(),
            memory_usage_mb: get_memory_usage_mb(),
        }
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Resident set size from `/proc`, 0 where that is unavailable.
fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let kb = status
                .lines()
                .find(|line| line.starts_with("VmRSS:"))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<u64>().ok());
            if let Some(kb) = kb {
                return kb as f32 / 1024.0;
            }
        }
    }
    0.0
}
