//! Tenant extraction for `/api` routes.
//!
//! Authentication happens upstream; the proxy forwards the caller as
//! `x-user-id` and `x-org-id`. A request without a user id is rejected with
//! 401. The org id defaults to the user id for personal accounts.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::lifecycle::Tenant;

pub const HEADER_USER_ID: &str = "x-user-id";
pub const HEADER_ORG_ID: &str = "x-org-id";

fn header<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

impl<S: Send + Sync> FromRequestParts<S> for Tenant {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = header(parts, HEADER_USER_ID).ok_or_else(|| {
            (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({"error": "missing x-user-id header"})),
            )
                .into_response()
        })?;
        let org_id = header(parts, HEADER_ORG_ID).unwrap_or(user_id);
        Ok(Tenant {
            user_id: user_id.to_string(),
            org_id: org_id.to_string(),
        })
    }
}
