//! # Worker Reconciler: Remote Worker State → Local Worker Rows
//!
//! Every pass lists the workers of each `running`/`deploying` endpoint on its
//! cluster and merges them into the `workers` table:
//!
//! - unknown worker → insert; billing starts `active` at `pod_started_at`
//!   when the cluster already reports a start time, otherwise `pending`
//! - known worker → refresh status, counters, heartbeat, last task time;
//!   the first start time seen moves billing `pending → active`
//! - tracked worker missing from the listing → fetch its detail and mark it
//!   OFFLINE with a termination time
//!
//! A vanished worker always ends up OFFLINE with `pod_terminated_at` set.
//! The termination time is the first of: the cluster's `terminated_at`, the
//! cluster's last heartbeat, the local last heartbeat, now. This module is the
//! only writer of `pod_terminated_at`.
//!
//! Clusters are reconciled concurrently. A failing cluster, endpoint or
//! worker is logged and skipped; the next pass retries it.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cluster_client::{ClientRegistry, ClusterApi};
use crate::db::{BillingStatus, EndpointRow, NewWorker, WorkerObservation, WorkerRow};
use crate::error::FleetError;
use crate::prom_metrics::Metrics;
use crate::remote::{decode_worker_list, RemoteWorker};
use crate::store::FleetStore;

/// Status recorded for a new worker whose payload carries none.
const DEFAULT_WORKER_STATUS: &str = "STARTING";

/// Counters for one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub endpoints: usize,
    pub endpoints_failed: usize,
    pub clusters_failed: usize,
    pub discovered: usize,
    pub updated: usize,
    pub activated: usize,
    pub marked_offline: usize,
}

impl ReconcileSummary {
    fn merge(&mut self, other: ReconcileSummary) {
        self.endpoints += other.endpoints;
        self.endpoints_failed += other.endpoints_failed;
        self.clusters_failed += other.clusters_failed;
        self.discovered += other.discovered;
        self.updated += other.updated;
        self.activated += other.activated;
        self.marked_offline += other.marked_offline;
    }
}

/// Termination estimate for a worker that is gone from its cluster.
///
/// Never earlier than the local billing cursor: time already charged stays
/// charged, and the worker can still be finalized.
pub fn termination_time(
    remote: Option<&RemoteWorker>,
    local: Option<&WorkerRow>,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    let estimate = remote
        .and_then(RemoteWorker::termination_estimate)
        .or_else(|| local.and_then(|w| w.last_heartbeat))
        .unwrap_or(now);
    match local.and_then(|w| w.last_billed_at) {
        Some(cursor) if cursor > estimate => cursor,
        _ => estimate,
    }
}

fn new_worker(endpoint: &EndpointRow, remote: &RemoteWorker) -> NewWorker {
    let billing_status = if remote.pod_started_at.is_some() {
        BillingStatus::Active
    } else {
        BillingStatus::Pending
    };
    NewWorker {
        worker_id: remote.id.clone(),
        endpoint_id: endpoint.id,
        cluster_id: endpoint.cluster_id.clone(),
        user_id: endpoint.user_id.clone(),
        pod_name: remote.pod_name.clone(),
        status: remote
            .status
            .clone()
            .unwrap_or_else(|| DEFAULT_WORKER_STATUS.to_string()),
        pod_created_at: remote.pod_created_at,
        pod_started_at: remote.pod_started_at,
        pod_ready_at: remote.pod_ready_at,
        cold_start_duration_ms: remote.cold_start_duration_ms,
        current_jobs: remote.current_jobs,
        total_tasks_completed: remote.total_tasks_completed,
        total_tasks_failed: remote.total_tasks_failed,
        last_task_time: remote.last_task_time,
        last_heartbeat: remote.last_heartbeat,
        billing_status,
        last_billed_at: remote.pod_started_at,
    }
}

fn observation(remote: &RemoteWorker) -> WorkerObservation {
    WorkerObservation {
        status: remote.status.clone(),
        pod_name: remote.pod_name.clone(),
        current_jobs: remote.current_jobs,
        total_tasks_completed: remote.total_tasks_completed,
        total_tasks_failed: remote.total_tasks_failed,
        pod_ready_at: remote.pod_ready_at,
        last_heartbeat: remote.last_heartbeat,
        last_task_time: remote.last_task_time,
    }
}

#[derive(Clone)]
pub struct WorkerReconciler {
    store: Arc<dyn FleetStore>,
    clients: Arc<ClientRegistry>,
    metrics: Arc<Metrics>,
}

impl WorkerReconciler {
    pub fn new(store: Arc<dyn FleetStore>, clients: Arc<ClientRegistry>, metrics: Arc<Metrics>) -> Self {
        WorkerReconciler {
            store,
            clients,
            metrics,
        }
    }

    /// One pass over every reconcilable endpoint. Only a failure to list the
    /// endpoints themselves is returned; everything below is contained.
    pub async fn run_pass(&self) -> Result<ReconcileSummary> {
        let endpoints = self
            .store
            .list_reconcilable_endpoints()
            .await
            .context("listing reconcilable endpoints")?;

        let mut by_cluster: BTreeMap<String, Vec<EndpointRow>> = BTreeMap::new();
        for ep in endpoints {
            by_cluster.entry(ep.cluster_id.clone()).or_default().push(ep);
        }

        let mut tasks = JoinSet::new();
        for (cluster_id, endpoints) in by_cluster {
            let this = self.clone();
            tasks.spawn(async move { this.reconcile_cluster(&cluster_id, &endpoints).await });
        }

        let mut summary = ReconcileSummary::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(s) => summary.merge(s),
                Err(e) => {
                    warn!(error = %e, "cluster reconciliation task panicked");
                    summary.clusters_failed += 1;
                }
            }
        }

        self.metrics.reconcile_passes.inc();
        if summary.discovered + summary.activated + summary.marked_offline > 0 {
            info!(
                endpoints = summary.endpoints,
                discovered = summary.discovered,
                activated = summary.activated,
                marked_offline = summary.marked_offline,
                failed = summary.endpoints_failed,
                "worker reconciliation pass"
            );
        } else {
            debug!(endpoints = summary.endpoints, "worker reconciliation pass, no changes");
        }
        Ok(summary)
    }

    async fn reconcile_cluster(&self, cluster_id: &str, endpoints: &[EndpointRow]) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();
        let cluster = match self.store.get_cluster(cluster_id).await {
            Ok(Some(c)) => c,
            Ok(None) => {
                warn!(cluster_id, "endpoints reference an unknown cluster");
                summary.clusters_failed = 1;
                summary.endpoints_failed = endpoints.len();
                return summary;
            }
            Err(e) => {
                warn!(cluster_id, error = %e, "failed to load cluster");
                summary.clusters_failed = 1;
                summary.endpoints_failed = endpoints.len();
                return summary;
            }
        };

        let client = self.clients.client_for(&cluster);
        for endpoint in endpoints {
            match self.reconcile_endpoint(client.as_ref(), endpoint).await {
                Ok(s) => summary.merge(s),
                Err(e) => {
                    warn!(
                        cluster_id,
                        endpoint = %endpoint.physical_name,
                        error = %e,
                        "endpoint reconciliation skipped"
                    );
                    summary.endpoints += 1;
                    summary.endpoints_failed += 1;
                }
            }
        }
        summary
    }

    /// Merge one endpoint's remote worker listing into local state.
    pub async fn reconcile_endpoint(
        &self,
        client: &dyn ClusterApi,
        endpoint: &EndpointRow,
    ) -> Result<ReconcileSummary> {
        let listing = client
            .list_endpoint_workers(&endpoint.physical_name)
            .await
            .inspect_err(|_| self.metrics.remote_error(&endpoint.cluster_id))
            .with_context(|| format!("listing workers of {}", endpoint.physical_name))?;
        let remote_workers = decode_worker_list(&listing);
        let now = Utc::now();

        let mut summary = ReconcileSummary {
            endpoints: 1,
            ..Default::default()
        };
        let mut seen = HashSet::with_capacity(remote_workers.len());

        for remote in &remote_workers {
            seen.insert(remote.id.clone());
            if let Err(e) = self.apply_remote_worker(endpoint, remote, now, &mut summary).await {
                warn!(worker_id = %remote.id, error = %e, "failed to apply remote worker state");
            }
        }

        let tracked = self.store.list_unterminated_workers(endpoint.id).await?;
        for local in tracked.iter().filter(|w| !seen.contains(&w.worker_id)) {
            match self.retire_worker(client, local, now).await {
                Ok(terminated_at) => {
                    summary.marked_offline += 1;
                    info!(
                        worker_id = %local.worker_id,
                        endpoint_id = endpoint.id,
                        terminated_at = %terminated_at,
                        "worker vanished from cluster, marked offline"
                    );
                }
                Err(e) => warn!(worker_id = %local.worker_id, error = %e, "failed to retire worker"),
            }
        }

        Ok(summary)
    }

    async fn apply_remote_worker(
        &self,
        endpoint: &EndpointRow,
        remote: &RemoteWorker,
        now: DateTime<Utc>,
        summary: &mut ReconcileSummary,
    ) -> Result<()> {
        let local = self.store.get_worker(&remote.id).await?;
        match &local {
            None => {
                if self.store.insert_worker(&new_worker(endpoint, remote)).await? {
                    summary.discovered += 1;
                    self.metrics.workers_discovered.inc();
                    debug!(
                        worker_id = %remote.id,
                        billing_active = remote.pod_started_at.is_some(),
                        "new worker"
                    );
                }
            }
            Some(row) => {
                self.store
                    .update_worker_observation(&remote.id, &observation(remote))
                    .await?;
                summary.updated += 1;
                if let (None, Some(started_at)) = (row.pod_started_at, remote.pod_started_at) {
                    if self.store.activate_worker_billing(&remote.id, started_at).await? {
                        summary.activated += 1;
                        self.metrics.workers_activated.inc();
                        info!(worker_id = %remote.id, started_at = %started_at, "worker billing activated");
                    }
                }
            }
        }

        if remote.is_offline() && !local.as_ref().is_some_and(WorkerRow::is_offline) {
            let terminated_at = termination_time(Some(remote), local.as_ref(), now);
            self.store.mark_worker_offline(&remote.id, terminated_at).await?;
            self.metrics.workers_marked_offline.inc();
            summary.marked_offline += 1;
        }
        Ok(())
    }

    /// Mark a worker that left the listing OFFLINE. A failed detail lookup
    /// falls back to local data.
    async fn retire_worker(
        &self,
        client: &dyn ClusterApi,
        local: &WorkerRow,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        let detail = match client.get_worker(&local.worker_id).await {
            Ok(v) => RemoteWorker::decode(&v),
            Err(e) => {
                if !e.is_not_found() {
                    self.metrics.remote_error(&local.cluster_id);
                }
                debug!(worker_id = %local.worker_id, error = %e, "worker detail unavailable");
                None
            }
        };
        let terminated_at = termination_time(detail.as_ref(), Some(local), now);
        self.store
            .mark_worker_offline(&local.worker_id, terminated_at)
            .await?;
        self.metrics.workers_marked_offline.inc();
        Ok(terminated_at)
    }

    /// Reconcile a single worker reported as terminated.
    ///
    /// The cluster's detail wins when it still shows the worker alive. A
    /// missing or unreachable detail accepts the report and marks it offline.
    pub async fn reconcile_worker(&self, worker_id: &str) -> Result<WorkerRow, FleetError> {
        let local = self
            .store
            .get_worker(worker_id)
            .await?
            .ok_or_else(|| FleetError::not_found("worker", worker_id))?;
        if local.is_offline() {
            return Ok(local);
        }

        let cluster = self
            .store
            .get_cluster(&local.cluster_id)
            .await?
            .ok_or_else(|| FleetError::not_found("cluster", &local.cluster_id))?;
        let client = self.clients.client_for(&cluster);
        let now = Utc::now();

        let detail = match client.get_worker(worker_id).await {
            Ok(v) => RemoteWorker::decode(&v),
            Err(e) => {
                warn!(worker_id, error = %e, "worker detail unavailable, accepting termination report");
                None
            }
        };

        match &detail {
            Some(remote) if !remote.is_offline() && remote.terminated_at.is_none() => {
                self.store
                    .update_worker_observation(worker_id, &observation(remote))
                    .await?;
                info!(worker_id, "termination report not confirmed by cluster");
            }
            _ => {
                let terminated_at = termination_time(detail.as_ref(), Some(&local), now);
                self.store.mark_worker_offline(worker_id, terminated_at).await?;
                self.metrics.workers_marked_offline.inc();
                info!(worker_id, terminated_at = %terminated_at, "worker marked offline on report");
            }
        }

        self.store
            .get_worker(worker_id)
            .await?
            .ok_or_else(|| FleetError::not_found("worker", worker_id))
    }
}
