//! Endpoint lifecycle API: create, inspect, scale, update, sync, delete.

use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;
use tracing::warn;

use super::{ApiResult, AppState};
use crate::cluster_client::{AutoscalerConfig, DeploymentUpdate};
use crate::lifecycle::{CreateEndpoint, Tenant};

pub(super) async fn handler_api_endpoints_list(
    State(state): State<Arc<AppState>>,
    tenant: Tenant,
) -> ApiResult<impl IntoResponse> {
    let endpoints = state.manager.list(&tenant).await?;
    Ok(Json(endpoints))
}

/// POST /api/endpoints: schedule, deploy and record a new endpoint.
pub(super) async fn handler_api_endpoints_create(
    State(state): State<Arc<AppState>>,
    tenant: Tenant,
    Json(payload): Json<CreateEndpoint>,
) -> ApiResult<impl IntoResponse> {
    let endpoint = state.manager.create(&tenant, &payload).await?;
    Ok((StatusCode::CREATED, Json(endpoint)))
}

pub(super) async fn handler_api_endpoint_get(
    State(state): State<Arc<AppState>>,
    tenant: Tenant,
    AxumPath(name): AxumPath<String>,
) -> ApiResult<impl IntoResponse> {
    let endpoint = state.manager.get(&tenant, &name).await?;
    Ok(Json(endpoint))
}

/// GET /api/endpoints/{name}/remote: the cluster's view of the deployment.
pub(super) async fn handler_api_endpoint_remote(
    State(state): State<Arc<AppState>>,
    tenant: Tenant,
    AxumPath(name): AxumPath<String>,
) -> ApiResult<impl IntoResponse> {
    let endpoint = state.manager.get(&tenant, &name).await?;
    let detail = state.manager.remote_detail(&endpoint).await?;
    Ok(Json(detail))
}

pub(super) async fn handler_api_endpoint_workers(
    State(state): State<Arc<AppState>>,
    tenant: Tenant,
    AxumPath(name): AxumPath<String>,
) -> ApiResult<impl IntoResponse> {
    let endpoint = state.manager.get(&tenant, &name).await?;
    let workers = state.store.list_endpoint_workers(endpoint.id).await?;
    Ok(Json(workers))
}

pub(super) async fn handler_api_endpoint_delete(
    State(state): State<Arc<AppState>>,
    tenant: Tenant,
    AxumPath(name): AxumPath<String>,
) -> ApiResult<impl IntoResponse> {
    state.manager.delete(&tenant, &name).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub(super) struct ScalePayload {
    replicas: i32,
}

pub(super) async fn handler_api_endpoint_scale(
    State(state): State<Arc<AppState>>,
    tenant: Tenant,
    AxumPath(name): AxumPath<String>,
    Json(payload): Json<ScalePayload>,
) -> ApiResult<impl IntoResponse> {
    let endpoint = state
        .manager
        .scale_by_name(&tenant, &name, payload.replicas)
        .await?;
    Ok(Json(endpoint))
}

pub(super) async fn handler_api_endpoint_deployment(
    State(state): State<Arc<AppState>>,
    tenant: Tenant,
    AxumPath(name): AxumPath<String>,
    Json(payload): Json<DeploymentUpdate>,
) -> ApiResult<impl IntoResponse> {
    let endpoint = state
        .manager
        .update_deployment(&tenant, &name, &payload)
        .await?;
    Ok(Json(endpoint))
}

pub(super) async fn handler_api_endpoint_autoscaler(
    State(state): State<Arc<AppState>>,
    tenant: Tenant,
    AxumPath(name): AxumPath<String>,
    Json(payload): Json<AutoscalerConfig>,
) -> ApiResult<impl IntoResponse> {
    let endpoint = state
        .manager
        .update_autoscaler(&tenant, &name, &payload)
        .await?;
    Ok(Json(endpoint))
}

/// POST /api/endpoints/{name}/sync: refresh the row from the cluster now
/// instead of waiting for the next sync tick.
pub(super) async fn handler_api_endpoint_sync(
    State(state): State<Arc<AppState>>,
    tenant: Tenant,
    AxumPath(name): AxumPath<String>,
) -> ApiResult<impl IntoResponse> {
    let endpoint = state.manager.get(&tenant, &name).await?;
    let cluster = state.manager.cluster_for(&endpoint).await?;
    let client = state.manager.clients().client_for(&cluster);
    if let Err(e) = state.endpoint_sync.sync_endpoint(client.as_ref(), &endpoint).await {
        warn!(endpoint = %endpoint.physical_name, error = %e, "on-demand endpoint sync failed");
        return Ok((
            StatusCode::BAD_GATEWAY,
            Json(serde_json::json!({"error": e.to_string()})),
        )
            .into_response());
    }
    let refreshed = state.manager.get(&tenant, &name).await?;
    Ok(Json(refreshed).into_response())
}
