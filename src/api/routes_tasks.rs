//! Cluster passthroughs scoped to one tenant endpoint: logs, tasks, metrics,
//! statistics and scaling history. Responses are relayed as the cluster
//! returns them.

use axum::extract::{Path as AxumPath, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

use super::{ApiResult, AppState};
use crate::cluster_client::{ClusterClient, TaskQuery};
use crate::db::EndpointRow;
use crate::error::FleetError;
use crate::lifecycle::Tenant;

async fn resolve(
    state: &AppState,
    tenant: &Tenant,
    name: &str,
) -> Result<(EndpointRow, ClusterClient), FleetError> {
    let endpoint = state.manager.get(tenant, name).await?;
    let client = state.manager.passthrough_client(&endpoint).await?;
    Ok((endpoint, client))
}

#[derive(Deserialize)]
pub(super) struct LogsQuery {
    pod_name: String,
    #[serde(default = "default_log_lines")]
    lines: u32,
}

fn default_log_lines() -> u32 {
    100
}

pub(super) async fn handler_api_endpoint_logs(
    State(state): State<Arc<AppState>>,
    tenant: Tenant,
    AxumPath(name): AxumPath<String>,
    Query(params): Query<LogsQuery>,
) -> ApiResult<impl IntoResponse> {
    let (endpoint, client) = resolve(&state, &tenant, &name).await?;
    let logs = client
        .worker_logs(&endpoint.physical_name, &params.pod_name, params.lines.min(5000))
        .await
        .map_err(|e| state.manager.remote_error(&endpoint, e))?;
    Ok(([("content-type", "text/plain; charset=utf-8")], logs))
}

pub(super) async fn handler_api_tasks_list(
    State(state): State<Arc<AppState>>,
    tenant: Tenant,
    AxumPath(name): AxumPath<String>,
    Query(query): Query<TaskQuery>,
) -> ApiResult<impl IntoResponse> {
    let (endpoint, client) = resolve(&state, &tenant, &name).await?;
    let tasks = client
        .list_tasks(&endpoint.physical_name, &query)
        .await
        .map_err(|e| state.manager.remote_error(&endpoint, e))?;
    Ok(Json(tasks))
}

#[derive(Deserialize)]
pub(super) struct SubmitPayload {
    #[serde(default)]
    input: Value,
    /// Wait for the result instead of queueing.
    #[serde(default)]
    sync: bool,
}

/// POST /api/endpoints/{name}/run
pub(super) async fn handler_api_task_submit(
    State(state): State<Arc<AppState>>,
    tenant: Tenant,
    AxumPath(name): AxumPath<String>,
    Json(payload): Json<SubmitPayload>,
) -> ApiResult<impl IntoResponse> {
    let (endpoint, client) = resolve(&state, &tenant, &name).await?;
    let result = if payload.sync {
        client
            .submit_task_sync(&endpoint.physical_name, &payload.input)
            .await
    } else {
        client.submit_task(&endpoint.physical_name, &payload.input).await
    };
    let task = result.map_err(|e| state.manager.remote_error(&endpoint, e))?;
    let status = if payload.sync {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((status, Json(task)))
}

pub(super) async fn handler_api_task_status(
    State(state): State<Arc<AppState>>,
    tenant: Tenant,
    AxumPath((name, task_id)): AxumPath<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let (endpoint, client) = resolve(&state, &tenant, &name).await?;
    let task = client
        .task_status(&task_id)
        .await
        .map_err(|e| state.manager.remote_error(&endpoint, e))?;
    Ok(Json(task))
}

pub(super) async fn handler_api_task_cancel(
    State(state): State<Arc<AppState>>,
    tenant: Tenant,
    AxumPath((name, task_id)): AxumPath<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let (endpoint, client) = resolve(&state, &tenant, &name).await?;
    client
        .cancel_task(&task_id)
        .await
        .map_err(|e| state.manager.remote_error(&endpoint, e))?;
    Ok(Json(serde_json::json!({"ok": true, "task_id": task_id})))
}

pub(super) async fn handler_api_task_timeline(
    State(state): State<Arc<AppState>>,
    tenant: Tenant,
    AxumPath((name, task_id)): AxumPath<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let (endpoint, client) = resolve(&state, &tenant, &name).await?;
    let timeline = client
        .task_timeline(&task_id)
        .await
        .map_err(|e| state.manager.remote_error(&endpoint, e))?;
    Ok(Json(timeline))
}

pub(super) async fn handler_api_task_execution_history(
    State(state): State<Arc<AppState>>,
    tenant: Tenant,
    AxumPath((name, task_id)): AxumPath<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let (endpoint, client) = resolve(&state, &tenant, &name).await?;
    let history = client
        .task_execution_history(&task_id)
        .await
        .map_err(|e| state.manager.remote_error(&endpoint, e))?;
    Ok(Json(history))
}

pub(super) async fn handler_api_endpoint_metrics(
    State(state): State<Arc<AppState>>,
    tenant: Tenant,
    AxumPath(name): AxumPath<String>,
) -> ApiResult<impl IntoResponse> {
    let (endpoint, client) = resolve(&state, &tenant, &name).await?;
    let metrics = client
        .endpoint_metrics(&endpoint.physical_name)
        .await
        .map_err(|e| state.manager.remote_error(&endpoint, e))?;
    Ok(Json(metrics))
}

pub(super) async fn handler_api_endpoint_statistics(
    State(state): State<Arc<AppState>>,
    tenant: Tenant,
    AxumPath(name): AxumPath<String>,
) -> ApiResult<impl IntoResponse> {
    let (endpoint, client) = resolve(&state, &tenant, &name).await?;
    let stats = client
        .endpoint_statistics(&endpoint.physical_name)
        .await
        .map_err(|e| state.manager.remote_error(&endpoint, e))?;
    Ok(Json(stats))
}

#[derive(Deserialize)]
pub(super) struct StatsRangeQuery {
    from: Option<String>,
    to: Option<String>,
}

pub(super) async fn handler_api_endpoint_stats(
    State(state): State<Arc<AppState>>,
    tenant: Tenant,
    AxumPath(name): AxumPath<String>,
    Query(range): Query<StatsRangeQuery>,
) -> ApiResult<impl IntoResponse> {
    let (endpoint, client) = resolve(&state, &tenant, &name).await?;
    let stats = client
        .endpoint_stats(&endpoint.physical_name, range.from.as_deref(), range.to.as_deref())
        .await
        .map_err(|e| state.manager.remote_error(&endpoint, e))?;
    Ok(Json(stats))
}

#[derive(Deserialize)]
pub(super) struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    limit: u32,
}

fn default_history_limit() -> u32 {
    20
}

pub(super) async fn handler_api_endpoint_scaling_history(
    State(state): State<Arc<AppState>>,
    tenant: Tenant,
    AxumPath(name): AxumPath<String>,
    Query(params): Query<HistoryQuery>,
) -> ApiResult<impl IntoResponse> {
    let (endpoint, client) = resolve(&state, &tenant, &name).await?;
    let history = client
        .scaling_history(&endpoint.physical_name, params.limit.min(500))
        .await
        .map_err(|e| state.manager.remote_error(&endpoint, e))?;
    Ok(Json(history))
}
