//! Roster fan-out: one probe task per address, joined as a set.
//!
//! Every dispatched probe is awaited; a failure never cancels its siblings.

use crate::models::NodeReading;
use crate::prpc::StatsSource;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Partitioned result of polling the whole roster.
#[derive(Debug, Default)]
pub struct Collection {
    /// Successful readings, in roster order.
    pub successes: Vec<NodeReading>,
    pub failed: usize,
}

impl Collection {
    #[cfg(test)]
    pub fn settled(&self) -> usize {
        self.successes.len() + self.failed
    }
}

pub async fn collect(source: Arc<dyn StatsSource>, roster: &[String]) -> Collection {
    let mut probes = JoinSet::new();
    for (index, address) in roster.iter().cloned().enumerate() {
        let source = Arc::clone(&source);
        probes.spawn(async move {
            let outcome = source.fetch_stats(&address).await;
            (index, address, outcome)
        });
    }

    let mut readings = Vec::with_capacity(roster.len());
    let mut failed = 0;
    while let Some(joined) = probes.join_next().await {
        match joined {
            Ok((index, ip, Ok(stats))) => readings.push((index, NodeReading { ip, stats })),
            Ok((_, ip, Err(e))) => {
                debug!(address = %ip, error = %e, "pnode unavailable");
                failed += 1;
            }
            Err(e) => {
                warn!(error = %e, "probe task did not finish");
                failed += 1;
            }
        }
    }

    readings.sort_by_key(|(index, _)| *index);
    Collection { successes: readings.into_iter().map(|(_, r)| r).collect(), failed }
}
