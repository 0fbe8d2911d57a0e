//! # Endpoint Sync: Mirror Remote Deployment State
//!
//! Every tick, each live endpoint's detail is fetched from its cluster and
//! the local row is refreshed:
//!
//! | Remote field | Local column |
//! |--------------|--------------|
//! | `replicas` | `replicas` |
//! | `readyReplicas` | `current_replicas` |
//! | `image` | `image` |
//!
//! A `deploying` endpoint whose remote status reads `running` is promoted.
//! Clusters are processed concurrently; a remote error skips that endpoint
//! until the next tick.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cluster_client::{ClientRegistry, ClusterApi};
use crate::db::{EndpointChanges, EndpointRow, EndpointStatus};
use crate::prom_metrics::Metrics;
use crate::remote::RemoteEndpointState;
use crate::store::FleetStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    pub endpoints: usize,
    pub updated: usize,
    pub promoted: usize,
    pub failed: usize,
}

impl SyncSummary {
    fn merge(&mut self, other: SyncSummary) {
        self.endpoints += other.endpoints;
        self.updated += other.updated;
        self.promoted += other.promoted;
        self.failed += other.failed;
    }
}

/// Local column changes implied by a remote snapshot. Empty when the row
/// already matches.
pub fn diff(endpoint: &EndpointRow, remote: &RemoteEndpointState) -> EndpointChanges {
    EndpointChanges {
        replicas: remote.replicas.filter(|r| *r != endpoint.replicas),
        current_replicas: remote
            .ready_replicas
            .filter(|r| *r != endpoint.current_replicas),
        image: remote.image.clone().filter(|i| *i != endpoint.image),
        ..Default::default()
    }
}

#[derive(Clone)]
pub struct EndpointSync {
    store: Arc<dyn FleetStore>,
    clients: Arc<ClientRegistry>,
    metrics: Arc<Metrics>,
}

impl EndpointSync {
    pub fn new(store: Arc<dyn FleetStore>, clients: Arc<ClientRegistry>, metrics: Arc<Metrics>) -> Self {
        EndpointSync {
            store,
            clients,
            metrics,
        }
    }

    pub async fn run_pass(&self) -> Result<SyncSummary> {
        let endpoints = self
            .store
            .list_live_endpoints()
            .await
            .context("listing live endpoints")?;

        let mut by_cluster: BTreeMap<String, Vec<EndpointRow>> = BTreeMap::new();
        for ep in endpoints {
            by_cluster.entry(ep.cluster_id.clone()).or_default().push(ep);
        }

        let mut tasks = JoinSet::new();
        for (cluster_id, endpoints) in by_cluster {
            let this = self.clone();
            tasks.spawn(async move { this.sync_cluster(&cluster_id, &endpoints).await });
        }

        let mut summary = SyncSummary::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(s) => summary.merge(s),
                Err(e) => warn!(error = %e, "endpoint sync task panicked"),
            }
        }

        if summary.updated + summary.promoted > 0 {
            info!(
                endpoints = summary.endpoints,
                updated = summary.updated,
                promoted = summary.promoted,
                failed = summary.failed,
                "endpoint sync pass"
            );
        } else {
            debug!(endpoints = summary.endpoints, "endpoint sync pass, no changes");
        }
        Ok(summary)
    }

    async fn sync_cluster(&self, cluster_id: &str, endpoints: &[EndpointRow]) -> SyncSummary {
        let mut summary = SyncSummary {
            endpoints: endpoints.len(),
            ..Default::default()
        };
        let cluster = match self.store.get_cluster(cluster_id).await {
            Ok(Some(c)) => c,
            Ok(None) => {
                warn!(cluster_id, "endpoints reference an unknown cluster");
                summary.failed = endpoints.len();
                return summary;
            }
            Err(e) => {
                warn!(cluster_id, error = %e, "failed to load cluster");
                summary.failed = endpoints.len();
                return summary;
            }
        };

        let client = self.clients.client_for(&cluster);
        for endpoint in endpoints {
            match self.sync_endpoint(client.as_ref(), endpoint).await {
                Ok((updated, promoted)) => {
                    summary.updated += usize::from(updated);
                    summary.promoted += usize::from(promoted);
                }
                Err(e) => {
                    summary.failed += 1;
                    warn!(
                        cluster_id,
                        endpoint = %endpoint.physical_name,
                        error = %e,
                        "endpoint sync skipped"
                    );
                }
            }
        }
        summary
    }

    /// Returns `(columns_updated, promoted_to_running)`.
    pub async fn sync_endpoint(&self, client: &dyn ClusterApi, endpoint: &EndpointRow) -> Result<(bool, bool)> {
        let detail = client
            .get_endpoint(&endpoint.physical_name)
            .await
            .inspect_err(|_| self.metrics.remote_error(&endpoint.cluster_id))
            .with_context(|| format!("fetching detail of {}", endpoint.physical_name))?;
        let remote = RemoteEndpointState::decode(&detail);

        let changes = diff(endpoint, &remote);
        let updated = !changes.is_empty();
        if updated {
            self.store.apply_endpoint_changes(endpoint.id, &changes).await?;
        }

        let promoted = endpoint.status == EndpointStatus::Deploying && remote.is_running();
        if promoted {
            self.store
                .set_endpoint_status(endpoint.id, EndpointStatus::Running)
                .await?;
            info!(endpoint = %endpoint.physical_name, "endpoint reported running, promoted");
        }
        Ok((updated, promoted))
    }
}
