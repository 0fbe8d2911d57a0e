//! # Errors: Request-Path Failure Taxonomy
//!
//! Background loops log and move on; request-path operations (cluster
//! selection, endpoint create/delete/scale/update) return [`FleetError`] so
//! callers can tell the failure categories apart:
//!
//! | Category | Variants | Caller action |
//! |----------|----------|---------------|
//! | not-found | `SpecNotFound`, `NotFound` | fix the request |
//! | capacity | `NoCapacity` | retry later |
//! | remote-unavailable | `Remote` | retry, outcome may be unknown |
//! | invalid | `InvalidRequest` | fix the request |
//! | conflict | `Conflict` | pick another name |
//! | persistence | `Persistence` | retry |
//! | compensation | `CompensationFailed` | operator must clean up the cluster |
//!
//! [`RemoteError`] is produced by the cluster and balance HTTP clients.

use thiserror::Error;

/// Failure talking to a remote execution cluster or the balance authority.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("remote returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("failed to decode remote response: {0}")]
    Decode(String),
}

impl RemoteError {
    /// True when the remote side may or may not have applied the request.
    pub fn is_unavailable(&self) -> bool {
        match self {
            RemoteError::Timeout(_) | RemoteError::Connect(_) => true,
            RemoteError::Status { status, .. } => *status >= 500,
            RemoteError::Decode(_) => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteError::Status { status: 404, .. })
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            RemoteError::Timeout(e.to_string())
        } else if e.is_decode() {
            RemoteError::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            RemoteError::Status {
                status: status.as_u16(),
                body: e.to_string(),
            }
        } else {
            RemoteError::Connect(e.to_string())
        }
    }
}

/// Coarse category of a [`FleetError`], used for HTTP mapping and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Invalid,
    Capacity,
    RemoteUnavailable,
    Conflict,
    Persistence,
    Compensation,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Invalid => "invalid",
            ErrorKind::Capacity => "capacity",
            ErrorKind::RemoteUnavailable => "remote_unavailable",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Persistence => "persistence",
            ErrorKind::Compensation => "compensation",
        }
    }
}

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("spec not found: {0}")]
    SpecNotFound(String),
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("no cluster has capacity for spec {0}")]
    NoCapacity(String),
    #[error("cluster {cluster_id} request failed: {source}")]
    Remote {
        cluster_id: String,
        #[source]
        source: RemoteError,
    },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("persistence error: {0}")]
    Persistence(#[source] anyhow::Error),
    #[error("persistence error: {source}; compensating delete of {physical_name} on cluster {cluster_id} also failed: {compensation}")]
    CompensationFailed {
        cluster_id: String,
        physical_name: String,
        #[source]
        source: anyhow::Error,
        compensation: RemoteError,
    },
}

impl FleetError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FleetError::SpecNotFound(_) | FleetError::NotFound { .. } => ErrorKind::NotFound,
            FleetError::InvalidRequest(_) => ErrorKind::Invalid,
            FleetError::NoCapacity(_) => ErrorKind::Capacity,
            FleetError::Remote { .. } => ErrorKind::RemoteUnavailable,
            FleetError::Conflict(_) => ErrorKind::Conflict,
            FleetError::Persistence(_) => ErrorKind::Persistence,
            FleetError::CompensationFailed { .. } => ErrorKind::Compensation,
        }
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        FleetError::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn remote(cluster_id: impl Into<String>, source: RemoteError) -> Self {
        FleetError::Remote {
            cluster_id: cluster_id.into(),
            source,
        }
    }
}

impl From<anyhow::Error> for FleetError {
    fn from(e: anyhow::Error) -> Self {
        FleetError::Persistence(e)
    }
}
