use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;
use tracing::warn;

/// pNodes known to expose their pRPC port.
pub const DEFAULT_ROSTER: [&str; 9] = [
    "173.212.203.145",
    "173.212.220.65",
    "161.97.97.41",
    "192.190.136.36",
    "192.190.136.37",
    "192.190.136.38",
    "192.190.136.28",
    "192.190.136.29",
    "207.244.255.1",
];

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    pub roster: Vec<String>,
    pub prpc: PrpcConf,
    pub retention: RetentionConf,
    pub schedule: ScheduleConf,
    pub store: StoreConf,
    pub http: HttpConf,
    pub estimates: EstimatesConf,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct PrpcConf {
    pub port: u16,
    pub path: String,
    pub timeout_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct RetentionConf {
    pub hours_to_keep: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ScheduleConf {
    /// 0 disables the in-process scheduler (external cron only).
    pub interval_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Sqlite,
    Memory,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct StoreConf {
    pub backend: StoreBackend,
    pub path: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct HttpConf {
    pub bind: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct EstimatesConf {
    /// Reported as `averageLatency` until a real latency probe exists.
    pub average_latency_ms: f64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            roster: DEFAULT_ROSTER.iter().map(|ip| ip.to_string()).collect(),
            prpc: PrpcConf::default(),
            retention: RetentionConf::default(),
            schedule: ScheduleConf::default(),
            store: StoreConf::default(),
            http: HttpConf::default(),
            estimates: EstimatesConf::default(),
        }
    }
}

impl Default for PrpcConf {
    fn default() -> Self {
        Self { port: 6000, path: "/rpc".into(), timeout_ms: 5_000 }
    }
}

impl Default for RetentionConf {
    fn default() -> Self {
        Self { hours_to_keep: 24 }
    }
}

impl Default for ScheduleConf {
    fn default() -> Self {
        Self { interval_secs: 300 }
    }
}

impl Default for StoreConf {
    fn default() -> Self {
        Self { backend: StoreBackend::Sqlite, path: "./data/pnode-sync.db".into() }
    }
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { bind: "0.0.0.0:8080".into() }
    }
}

impl Default for EstimatesConf {
    fn default() -> Self {
        Self { average_latency_ms: 35.0 }
    }
}

impl SyncConfig {
    /// Drops blank and repeated roster entries, keeping first-seen order.
    fn normalized(mut self) -> Self {
        let mut seen = std::collections::HashSet::new();
        self.roster = self
            .roster
            .into_iter()
            .map(|addr| addr.trim().to_string())
            .filter(|addr| {
                if addr.is_empty() {
                    return false;
                }
                if !seen.insert(addr.clone()) {
                    warn!(address = %addr, "duplicate roster entry ignored");
                    return false;
                }
                true
            })
            .collect();
        self
    }
}

pub fn parse_config(txt: &str) -> Result<SyncConfig, serde_yaml::Error> {
    if txt.trim().is_empty() {
        return Ok(SyncConfig::default());
    }
    serde_yaml::from_str::<SyncConfig>(txt).map(SyncConfig::normalized)
}

pub async fn load_config() -> SyncConfig {
    let path = std::env::var("PNODE_SYNC_CONFIG").unwrap_or_else(|_| "pnode-sync.yaml".into());
    if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        parse_config(&txt).unwrap_or_else(|e| {
            warn!(%path, error = %e, "invalid config, using defaults");
            SyncConfig::default()
        })
    } else {
        warn!(%path, "no config file, using defaults");
        SyncConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = SyncConfig::default();
        assert_eq!(cfg.roster.len(), 9);
        assert_eq!(cfg.prpc.port, 6000);
        assert_eq!(cfg.prpc.path, "/rpc");
        assert_eq!(cfg.prpc.timeout_ms, 5_000);
        assert_eq!(cfg.retention.hours_to_keep, 24);
        assert_eq!(cfg.store.backend, StoreBackend::Sqlite);
    }

    #[test]
    fn test_empty_file_yields_defaults() {
        assert_eq!(parse_config("  \n").unwrap(), SyncConfig::default());
    }

    #[test]
    fn test_partial_yaml_keeps_other_defaults() {
        let cfg = parse_config(
            "roster: [\"10.0.0.1\", \"10.0.0.2\"]\nretention:\n  hours_to_keep: 48\nstore:\n  backend: memory\n",
        )
        .unwrap();
        assert_eq!(cfg.roster, vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(cfg.retention.hours_to_keep, 48);
        assert_eq!(cfg.store.backend, StoreBackend::Memory);
        assert_eq!(cfg.prpc.port, 6000);
        assert_eq!(cfg.http.bind, "0.0.0.0:8080");
    }

    #[test]
    fn test_roster_is_deduplicated_in_order() {
        let cfg = parse_config("roster: [\"b\", \" a \", \"b\", \"\"]").unwrap();
        assert_eq!(cfg.roster, vec!["b", "a"]);
    }

    #[test]
    fn test_invalid_yaml_is_an_error() {
        assert!(parse_config("retention: [not, a, map]").is_err());
    }
}
