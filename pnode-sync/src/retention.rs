//! Time-bounded deletion of old snapshots and sync logs.

use crate::config::RetentionConf;
use crate::models::RetentionReport;
use crate::store::{SnapshotStore, StoreError};
use time::{Duration, OffsetDateTime, PrimitiveDateTime};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub hours_to_keep: u32,
}

impl RetentionPolicy {
    pub fn new(hours_to_keep: u32) -> Self {
        Self { hours_to_keep }
    }

    /// Saturates at the earliest representable instant for huge windows.
    pub fn cutoff(&self, now: OffsetDateTime) -> OffsetDateTime {
        now.checked_sub(Duration::hours(i64::from(self.hours_to_keep)))
            .unwrap_or_else(|| PrimitiveDateTime::MIN.assume_utc())
    }

    /// Deletes everything strictly older than the cutoff. Running it twice in
    /// a row deletes nothing the second time.
    pub async fn sweep(
        &self,
        store: &dyn SnapshotStore,
        now: OffsetDateTime,
    ) -> Result<RetentionReport, StoreError> {
        let cutoff = self.cutoff(now);
        let report = store.delete_older_than(cutoff).await?;
        info!(
            hours_to_keep = self.hours_to_keep,
            deleted_pnodes = report.deleted_pnodes,
            deleted_network_stats = report.deleted_network_stats,
            deleted_sync_logs = report.deleted_sync_logs,
            "retention sweep done"
        );
        Ok(report)
    }
}

impl From<&RetentionConf> for RetentionPolicy {
    fn from(conf: &RetentionConf) -> Self {
        Self::new(conf.hours_to_keep)
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::new(24)
    }
}
