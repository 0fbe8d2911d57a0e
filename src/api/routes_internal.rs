//! Internal routes called by cluster agents and platform services.

use axum::extract::{Path as AxumPath, State};
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};

use super::{ApiResult, AppState};
use crate::error::FleetError;

/// POST /internal/workers/{worker_id}/terminated
///
/// Reconciles the worker against its cluster, then queues it for immediate
/// metering so the final slice is charged without waiting for the next cycle.
pub(super) async fn handler_internal_worker_terminated(
    State(state): State<Arc<AppState>>,
    AxumPath(worker_id): AxumPath<String>,
) -> ApiResult<impl IntoResponse> {
    let worker = state.reconciler.reconcile_worker(&worker_id).await?;
    let queued = worker.is_offline() && state.metering.request(&worker_id);
    info!(
        worker_id = %worker_id,
        status = %worker.status,
        billing_queued = queued,
        "worker termination reported"
    );
    Ok(Json(serde_json::json!({
        "worker_id": worker.worker_id,
        "status": worker.status,
        "pod_terminated_at": worker.pod_terminated_at,
        "billing_status": worker.billing_status,
        "billing_queued": queued,
    })))
}

/// POST /internal/clusters/{cluster_id}/heartbeat: refreshes
/// `last_heartbeat_at` and reactivates an offline cluster.
pub(super) async fn handler_internal_cluster_heartbeat(
    State(state): State<Arc<AppState>>,
    AxumPath(cluster_id): AxumPath<String>,
) -> ApiResult<impl IntoResponse> {
    let now = Utc::now();
    if !state.store.record_cluster_heartbeat(&cluster_id, now).await? {
        return Err(FleetError::not_found("cluster", cluster_id).into());
    }
    debug!(cluster_id = %cluster_id, "cluster heartbeat");
    Ok(Json(serde_json::json!({"ok": true, "at": now})))
}

/// GET /internal/clusters/{cluster_id}/overview: the cluster's task overview.
pub(super) async fn handler_internal_cluster_overview(
    State(state): State<Arc<AppState>>,
    AxumPath(cluster_id): AxumPath<String>,
) -> ApiResult<impl IntoResponse> {
    let cluster = state
        .store
        .get_cluster(&cluster_id)
        .await?
        .ok_or_else(|| FleetError::not_found("cluster", &cluster_id))?;
    let overview = state
        .manager
        .clients()
        .http_client_for(&cluster)
        .tasks_overview()
        .await
        .map_err(|e| {
            state.prom_metrics.remote_error(&cluster_id);
            FleetError::remote(&cluster_id, e)
        })?;
    Ok(Json(overview))
}
