//! Cluster health sweep: active clusters whose last heartbeat is older than
//! the offline timeout are flipped to `offline`, which drops them out of
//! scheduling. A later heartbeat brings them back.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::prom_metrics::Metrics;
use crate::store::FleetStore;

/// Heartbeats older than this instant count as stale.
pub fn offline_cutoff(now: DateTime<Utc>, timeout: Duration) -> DateTime<Utc> {
    let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
    now.checked_sub_signed(timeout).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[derive(Clone)]
pub struct HealthMonitor {
    store: Arc<dyn FleetStore>,
    metrics: Arc<Metrics>,
    offline_timeout: Duration,
}

impl HealthMonitor {
    pub fn new(store: Arc<dyn FleetStore>, metrics: Arc<Metrics>, offline_timeout: Duration) -> Self {
        HealthMonitor {
            store,
            metrics,
            offline_timeout,
        }
    }

    /// One sweep; returns the clusters that went offline.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let cutoff = offline_cutoff(now, self.offline_timeout);
        let offline = self.store.mark_stale_clusters_offline(cutoff).await?;
        if offline.is_empty() {
            debug!(%cutoff, "all cluster heartbeats fresh");
        } else {
            self.metrics.clusters_marked_offline.inc_by(offline.len() as u64);
            for cluster_id in &offline {
                warn!(cluster_id = %cluster_id, %cutoff, "cluster heartbeat stale, marked offline");
            }
        }
        Ok(offline)
    }
}
