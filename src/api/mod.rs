//! # API: Operations HTTP Server
//!
//! Axum server for the control plane. Tenant routes trust the `x-user-id` /
//! `x-org-id` headers set by the upstream authenticating proxy; `/internal`
//! routes are for cluster agents and other platform services.
//!
//! | Route | Handler |
//! |-------|---------|
//! | `GET /healthz`, `GET /readyz`, `GET /metrics` | [`routes_health`] |
//! | `GET /api/schedule/preview` | scheduler dry run |
//! | `/api/endpoints[/{name}[/scale,/deployment,/autoscaler,/sync,/remote,/workers]]` | [`routes_endpoints`] |
//! | `/api/endpoints/{name}/{logs,tasks,run,metrics,statistics,stats,scaling-history}` | [`routes_tasks`] |
//! | `GET /api/billing/{transactions,usage}` | [`routes_billing`] |
//! | `POST /internal/workers/{id}/terminated`, `POST /internal/clusters/{id}/heartbeat` | [`routes_internal`] |
//!
//! Every request runs inside a `request` span carrying an `x-request-id`,
//! and its latency lands in the `fleetmeter_http_request_duration_seconds`
//! histogram under a normalized path label.

mod middleware_tenant;
mod routes_billing;
mod routes_endpoints;
mod routes_health;
mod routes_internal;
mod routes_tasks;

pub use middleware_tenant::{HEADER_ORG_ID, HEADER_USER_ID};

use anyhow::Result;
use axum::extract::{Query, Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, Instrument};

use crate::endpoint_sync::EndpointSync;
use crate::error::{ErrorKind, FleetError};
use crate::lifecycle::EndpointManager;
use crate::metering::MeteringTrigger;
use crate::prom_metrics::{self, Metrics};
use crate::reconciler::WorkerReconciler;
use crate::scheduler;
use crate::store::FleetStore;

pub struct AppState {
    pub store: Arc<dyn FleetStore>,
    pub manager: Arc<EndpointManager>,
    pub reconciler: WorkerReconciler,
    pub endpoint_sync: EndpointSync,
    pub metering: MeteringTrigger,
    pub prom_metrics: Arc<Metrics>,
}

/// Request-path error rendered as `{"error", "kind"}` with a status per
/// [`ErrorKind`].
#[derive(Debug)]
pub struct ApiError(pub FleetError);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self.0.kind() {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Invalid => StatusCode::BAD_REQUEST,
            ErrorKind::Capacity => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::RemoteUnavailable => StatusCode::BAD_GATEWAY,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Persistence | ErrorKind::Compensation => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<FleetError> for ApiError {
    fn from(e: FleetError) -> Self {
        ApiError(e)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError(FleetError::Persistence(e))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() && status != StatusCode::BAD_GATEWAY {
            error!(kind = self.0.kind().as_str(), error = %self.0, "request failed");
        }
        (
            status,
            Json(serde_json::json!({
                "error": self.0.to_string(),
                "kind": self.0.kind().as_str(),
            })),
        )
            .into_response()
    }
}

pub(crate) type ApiResult<T> = std::result::Result<T, ApiError>;

/// Records request latency, propagates or generates `x-request-id`, and
/// instruments the handler with a `request` span.
async fn metrics_middleware(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let method = req.method().to_string();
    let raw_path = req.uri().path().to_string();
    let norm_path = normalize_path(&raw_path);
    let start = std::time::Instant::now();

    let span = tracing::info_span!(
        "request",
        request_id = %request_id,
        method = %method,
        path = %raw_path,
    );
    let mut response = next.run(req).instrument(span).await;

    state
        .prom_metrics
        .http_request_duration
        .get_or_create(&prom_metrics::HttpLabel {
            method,
            path: norm_path,
        })
        .observe(start.elapsed().as_secs_f64());

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// Collapse per-resource path segments into placeholders so the latency
/// histogram keeps a bounded label set.
fn normalize_path(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').collect();
    segments
        .iter()
        .enumerate()
        .map(|(i, seg)| {
            let parent = if i > 0 { segments[i - 1] } else { "" };
            if seg.is_empty() {
                String::new()
            } else if seg.chars().all(|c| c.is_ascii_digit()) {
                ":id".to_string()
            } else if seg.len() == 36 && seg.chars().filter(|c| *c == '-').count() == 4 {
                ":uuid".to_string()
            } else if matches!(parent, "endpoints" | "workers" | "clusters" | "tasks") {
                ":name".to_string()
            } else {
                seg.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[derive(Deserialize)]
pub(crate) struct SchedulePreviewQuery {
    spec_name: String,
    #[serde(default)]
    region: Option<String>,
}

/// GET /api/schedule/preview: run cluster selection without creating anything.
async fn handler_api_schedule_preview(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SchedulePreviewQuery>,
) -> ApiResult<impl IntoResponse> {
    let selection = scheduler::select_cluster(
        state.store.as_ref(),
        &params.spec_name,
        params.region.as_deref().unwrap_or(""),
    )
    .await?;
    Ok(Json(selection))
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(routes_health::handler_healthz))
        .route("/readyz", get(routes_health::handler_readyz))
        .route("/metrics", get(routes_health::handler_metrics))
        .route("/api/schedule/preview", get(handler_api_schedule_preview))
        .route(
            "/api/endpoints",
            get(routes_endpoints::handler_api_endpoints_list)
                .post(routes_endpoints::handler_api_endpoints_create),
        )
        .route(
            "/api/endpoints/{name}",
            get(routes_endpoints::handler_api_endpoint_get)
                .delete(routes_endpoints::handler_api_endpoint_delete),
        )
        .route(
            "/api/endpoints/{name}/remote",
            get(routes_endpoints::handler_api_endpoint_remote),
        )
        .route(
            "/api/endpoints/{name}/workers",
            get(routes_endpoints::handler_api_endpoint_workers),
        )
        .route(
            "/api/endpoints/{name}/scale",
            post(routes_endpoints::handler_api_endpoint_scale),
        )
        .route(
            "/api/endpoints/{name}/deployment",
            axum::routing::patch(routes_endpoints::handler_api_endpoint_deployment),
        )
        .route(
            "/api/endpoints/{name}/autoscaler",
            put(routes_endpoints::handler_api_endpoint_autoscaler),
        )
        .route(
            "/api/endpoints/{name}/sync",
            post(routes_endpoints::handler_api_endpoint_sync),
        )
        .route(
            "/api/endpoints/{name}/logs",
            get(routes_tasks::handler_api_endpoint_logs),
        )
        .route(
            "/api/endpoints/{name}/tasks",
            get(routes_tasks::handler_api_tasks_list),
        )
        .route(
            "/api/endpoints/{name}/tasks/{task_id}",
            get(routes_tasks::handler_api_task_status),
        )
        .route(
            "/api/endpoints/{name}/tasks/{task_id}/cancel",
            post(routes_tasks::handler_api_task_cancel),
        )
        .route(
            "/api/endpoints/{name}/tasks/{task_id}/timeline",
            get(routes_tasks::handler_api_task_timeline),
        )
        .route(
            "/api/endpoints/{name}/tasks/{task_id}/execution-history",
            get(routes_tasks::handler_api_task_execution_history),
        )
        .route(
            "/api/endpoints/{name}/run",
            post(routes_tasks::handler_api_task_submit),
        )
        .route(
            "/api/endpoints/{name}/metrics",
            get(routes_tasks::handler_api_endpoint_metrics),
        )
        .route(
            "/api/endpoints/{name}/statistics",
            get(routes_tasks::handler_api_endpoint_statistics),
        )
        .route(
            "/api/endpoints/{name}/stats",
            get(routes_tasks::handler_api_endpoint_stats),
        )
        .route(
            "/api/endpoints/{name}/scaling-history",
            get(routes_tasks::handler_api_endpoint_scaling_history),
        )
        .route(
            "/api/billing/transactions",
            get(routes_billing::handler_api_billing_transactions),
        )
        .route(
            "/api/billing/usage",
            get(routes_billing::handler_api_billing_usage),
        )
        .route(
            "/api/billing/workers/{worker_id}/transactions",
            get(routes_billing::handler_api_billing_worker_transactions),
        )
        .route(
            "/internal/workers/{worker_id}/terminated",
            post(routes_internal::handler_internal_worker_terminated),
        )
        .route(
            "/internal/clusters/{cluster_id}/heartbeat",
            post(routes_internal::handler_internal_cluster_heartbeat),
        )
        .route(
            "/internal/clusters/{cluster_id}/overview",
            get(routes_internal::handler_internal_cluster_overview),
        )
        .layer(CatchPanicLayer::new())
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            metrics_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(1024 * 1024))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(30),
        ))
        .with_state(state)
}

/// Serve until SIGINT/SIGTERM, or until `shutdown` resolves.
pub async fn serve(
    state: Arc<AppState>,
    port: u16,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = build_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(port, "api listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("api shut down gracefully");
    Ok(())
}

pub async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("received SIGINT, shutting down"),
                    _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable, waiting for SIGINT only");
                ctrl_c.await.ok();
                info!("received SIGINT, shutting down");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("received SIGINT, shutting down");
    }
}
