//! Ledger queries for the calling tenant.

use axum::extract::{Path as AxumPath, Query, State};
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{ApiResult, AppState};
use crate::db::UsageTotals;
use crate::error::FleetError;
use crate::lifecycle::Tenant;

const MAX_PAGE: i64 = 500;

#[derive(Deserialize)]
pub(super) struct PageQuery {
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

fn default_limit() -> i64 {
    50
}

/// GET /api/billing/transactions: newest first.
pub(super) async fn handler_api_billing_transactions(
    State(state): State<Arc<AppState>>,
    tenant: Tenant,
    Query(page): Query<PageQuery>,
) -> ApiResult<impl IntoResponse> {
    let limit = page.limit.clamp(1, MAX_PAGE);
    let offset = page.offset.max(0);
    let rows = state
        .store
        .list_user_transactions(&tenant.user_id, limit, offset)
        .await?;
    Ok(Json(serde_json::json!({
        "transactions": rows,
        "limit": limit,
        "offset": offset,
    })))
}

#[derive(Deserialize)]
pub(super) struct UsageQuery {
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct UsageResponse {
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    #[serde(flatten)]
    totals: UsageTotals,
}

/// GET /api/billing/usage: totals of successful charges in `[from, to)`.
/// Defaults to the last 30 days.
pub(super) async fn handler_api_billing_usage(
    State(state): State<Arc<AppState>>,
    tenant: Tenant,
    Query(range): Query<UsageQuery>,
) -> ApiResult<impl IntoResponse> {
    let to = range.to.unwrap_or_else(Utc::now);
    let from = range.from.unwrap_or(to - Duration::days(30));
    if from > to {
        return Err(FleetError::InvalidRequest("from must not be after to".into()).into());
    }
    let totals = state.store.usage_totals(&tenant.user_id, from, to).await?;
    Ok(Json(UsageResponse { from, to, totals }))
}

/// GET /api/billing/workers/{worker_id}/transactions: one worker's ledger,
/// only for its owner.
pub(super) async fn handler_api_billing_worker_transactions(
    State(state): State<Arc<AppState>>,
    tenant: Tenant,
    AxumPath(worker_id): AxumPath<String>,
) -> ApiResult<impl IntoResponse> {
    let owned = state
        .store
        .get_worker(&worker_id)
        .await?
        .filter(|w| w.user_id == tenant.user_id);
    if owned.is_none() {
        return Err(FleetError::not_found("worker", worker_id).into());
    }
    let rows = state.store.list_worker_transactions(&worker_id).await?;
    Ok(Json(rows))
}
