//! # Database: PostgreSQL Storage Layer
//!
//! Async persistence for the fleet control plane via `sqlx::PgPool`.
//!
//! ## Schema
//!
//! - `clusters`: execution cluster registry (connection info, status, priority, heartbeat)
//! - `cluster_specs`: per-cluster capacity rows keyed by (cluster, spec)
//! - `spec_pricing`: resource/price templates
//! - `user_endpoints`: tenant endpoints, logical → physical mapping, locked price
//! - `workers`: reconciled worker rows with their billing sub-state
//! - `billing_transactions`: append-only ledger
//!
//! The schema lives in `migrations/001_fleet_schema.sql` and is applied by
//! [`Database::migrate`] (the `migrate` subcommand).
//!
//! ## Module Structure
//!
//! - [`clusters`]: cluster registry, capacity rows, spec pricing
//! - [`endpoints`]: endpoint insert/lookup/status/replica updates
//! - [`workers`]: worker upserts, offline marking, billing eligibility
//! - [`billing`]: ledger transaction and ledger queries
//!
//! Status columns are stored as text. Rows decode them into enums through
//! `#[sqlx(try_from = "String")]`; writes bind `as_str()`.

mod billing;
mod clusters;
mod endpoints;
mod workers;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::types::Json;
use std::collections::BTreeMap;

const SCHEMA_SQL: &str = include_str!("../../migrations/001_fleet_schema.sql");

/// Environment variables passed to an endpoint's containers.
pub type EnvVars = BTreeMap<String, String>;

/// Worker status reported by the cluster once a worker is gone.
pub const WORKER_STATUS_OFFLINE: &str = "OFFLINE";

#[derive(Debug, thiserror::Error)]
#[error("unknown {kind} status: {value}")]
pub struct UnknownStatus {
    kind: &'static str,
    value: String,
}

macro_rules! text_status {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = UnknownStatus;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(UnknownStatus {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl TryFrom<String> for $name {
            type Error = UnknownStatus;

            fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
                value.parse()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

text_status!(ClusterStatus, "cluster", {
    Active => "active",
    Offline => "offline",
});

text_status!(EndpointStatus, "endpoint", {
    Deploying => "deploying",
    Running => "running",
    Suspended => "suspended",
    Deleted => "deleted",
});

text_status!(BillingStatus, "billing", {
    Pending => "pending",
    Active => "active",
    FinalBilled => "final_billed",
});

text_status!(TransactionStatus, "transaction", {
    Success => "success",
    InsufficientBalance => "insufficient_balance",
    Failed => "failed",
});

// ── Cluster registry ────────────────────────────────────────────

#[derive(Clone, Serialize, sqlx::FromRow)]
pub struct ClusterRow {
    pub cluster_id: String,
    pub cluster_name: String,
    pub region: String,
    pub api_endpoint: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    #[sqlx(try_from = "String")]
    pub status: ClusterStatus,
    pub priority: i32,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl std::fmt::Debug for ClusterRow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterRow")
            .field("cluster_id", &self.cluster_id)
            .field("region", &self.region)
            .field("api_endpoint", &self.api_endpoint)
            .field("status", &self.status)
            .field("priority", &self.priority)
            .field("last_heartbeat_at", &self.last_heartbeat_at)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Deserialize)]
pub struct NewCluster {
    pub cluster_id: String,
    pub cluster_name: String,
    pub region: String,
    pub api_endpoint: String,
    pub api_key: String,
    pub priority: i32,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ClusterSpecRow {
    pub id: i64,
    pub cluster_id: String,
    /// Spec identifier inside the cluster (sent as `specName` on create).
    pub cluster_spec_name: String,
    /// Platform spec name, joins `spec_pricing.spec_name`.
    pub spec_name: String,
    pub total_capacity: i32,
    pub available_capacity: i32,
    pub is_available: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewClusterSpec {
    pub cluster_id: String,
    pub cluster_spec_name: String,
    pub spec_name: String,
    pub total_capacity: i32,
    pub available_capacity: i32,
    pub is_available: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SpecPricingRow {
    pub spec_name: String,
    /// `GPU` or `CPU`.
    pub spec_type: String,
    pub gpu_type: Option<String>,
    pub gpu_count: i32,
    pub cpu_cores: i32,
    pub ram_gb: i32,
    pub disk_gb: Option<i32>,
    /// Micro-units (1/1,000,000 of the display currency) per hour.
    pub price_per_hour: i64,
    pub currency: String,
    pub is_available: bool,
}

// ── Endpoints ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct EndpointRow {
    pub id: i64,
    pub user_id: String,
    pub org_id: String,
    pub logical_name: String,
    pub physical_name: String,
    pub spec_name: String,
    pub spec_type: String,
    pub gpu_type: Option<String>,
    pub gpu_count: i32,
    pub cpu_cores: i32,
    pub ram_gb: i32,
    pub cluster_id: String,
    pub replicas: i32,
    pub min_replicas: i32,
    pub max_replicas: i32,
    pub current_replicas: i32,
    pub image: String,
    pub task_timeout: i32,
    pub env: Json<EnvVars>,
    pub price_per_hour: i64,
    pub currency: String,
    pub prefer_region: Option<String>,
    #[sqlx(try_from = "String")]
    pub status: EndpointStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Insert payload for a new endpoint. Status starts at `deploying`.
#[derive(Debug, Clone)]
pub struct NewEndpoint {
    pub user_id: String,
    pub org_id: String,
    pub logical_name: String,
    pub physical_name: String,
    pub spec_name: String,
    pub spec_type: String,
    pub gpu_type: Option<String>,
    pub gpu_count: i32,
    pub cpu_cores: i32,
    pub ram_gb: i32,
    pub cluster_id: String,
    pub replicas: i32,
    pub min_replicas: i32,
    pub max_replicas: i32,
    pub image: String,
    pub task_timeout: i32,
    pub env: EnvVars,
    pub price_per_hour: i64,
    pub currency: String,
    pub prefer_region: Option<String>,
}

/// Partial update of an endpoint; `None` leaves the column untouched.
#[derive(Debug, Clone, Default)]
pub struct EndpointChanges {
    pub replicas: Option<i32>,
    pub current_replicas: Option<i32>,
    pub min_replicas: Option<i32>,
    pub max_replicas: Option<i32>,
    pub task_timeout: Option<i32>,
    pub image: Option<String>,
    pub env: Option<EnvVars>,
}

impl EndpointChanges {
    pub fn is_empty(&self) -> bool {
        self.replicas.is_none()
            && self.current_replicas.is_none()
            && self.min_replicas.is_none()
            && self.max_replicas.is_none()
            && self.task_timeout.is_none()
            && self.image.is_none()
            && self.env.is_none()
    }
}

// ── Workers ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct WorkerRow {
    pub id: i64,
    pub worker_id: String,
    pub endpoint_id: i64,
    pub cluster_id: String,
    pub user_id: String,
    pub pod_name: Option<String>,
    pub status: String,
    pub pod_created_at: Option<DateTime<Utc>>,
    pub pod_started_at: Option<DateTime<Utc>>,
    pub pod_ready_at: Option<DateTime<Utc>>,
    pub pod_terminated_at: Option<DateTime<Utc>>,
    pub cold_start_duration_ms: Option<i64>,
    pub current_jobs: i32,
    pub total_tasks_completed: i64,
    pub total_tasks_failed: i64,
    pub last_task_time: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    #[sqlx(try_from = "String")]
    pub billing_status: BillingStatus,
    pub last_billed_at: Option<DateTime<Utc>>,
    pub total_billed_seconds: i64,
    pub total_billed_amount: i64,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkerRow {
    pub fn is_offline(&self) -> bool {
        self.status.eq_ignore_ascii_case(WORKER_STATUS_OFFLINE)
    }

    /// Eligible for a metering cycle: billing active and the pod has started.
    pub fn is_billable(&self) -> bool {
        self.billing_status == BillingStatus::Active && self.pod_started_at.is_some()
    }
}

/// Insert payload for a worker first seen on a cluster.
#[derive(Debug, Clone)]
pub struct NewWorker {
    pub worker_id: String,
    pub endpoint_id: i64,
    pub cluster_id: String,
    pub user_id: String,
    pub pod_name: Option<String>,
    pub status: String,
    pub pod_created_at: Option<DateTime<Utc>>,
    pub pod_started_at: Option<DateTime<Utc>>,
    pub pod_ready_at: Option<DateTime<Utc>>,
    pub cold_start_duration_ms: Option<i64>,
    pub current_jobs: i32,
    pub total_tasks_completed: i64,
    pub total_tasks_failed: i64,
    pub last_task_time: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub billing_status: BillingStatus,
    pub last_billed_at: Option<DateTime<Utc>>,
}

/// Remote-observed state applied to an existing worker row. Optional
/// timestamps only overwrite when present.
#[derive(Debug, Clone)]
pub struct WorkerObservation {
    pub status: Option<String>,
    pub pod_name: Option<String>,
    pub current_jobs: i32,
    pub total_tasks_completed: i64,
    pub total_tasks_failed: i64,
    pub pod_ready_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_task_time: Option<DateTime<Utc>>,
}

// ── Billing ledger ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct BillingTransactionRow {
    pub id: i64,
    pub user_id: String,
    pub org_id: String,
    pub endpoint_id: i64,
    pub cluster_id: String,
    pub worker_id: String,
    pub gpu_type: Option<String>,
    pub gpu_count: i32,
    pub billing_period_start: DateTime<Utc>,
    pub billing_period_end: DateTime<Utc>,
    pub duration_seconds: i64,
    pub price_per_hour: i64,
    pub amount: i64,
    #[sqlx(try_from = "String")]
    pub status: TransactionStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Ledger row joined with its endpoint's names, for tenant listings.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct BillingTransactionView {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub transaction: BillingTransactionRow,
    pub logical_name: Option<String>,
    pub spec_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewBillingTransaction {
    pub user_id: String,
    pub org_id: String,
    pub endpoint_id: i64,
    pub cluster_id: String,
    pub worker_id: String,
    pub gpu_type: Option<String>,
    pub gpu_count: i32,
    pub billing_period_start: DateTime<Utc>,
    pub billing_period_end: DateTime<Utc>,
    pub duration_seconds: i64,
    pub price_per_hour: i64,
    pub amount: i64,
}

/// One metering charge: the ledger row plus the worker's expected billing
/// cursor. The worker update only applies while `last_billed_at` still equals
/// `expected_last_billed_at`.
#[derive(Debug, Clone)]
pub struct LedgerCharge {
    pub transaction: NewBillingTransaction,
    pub expected_last_billed_at: Option<DateTime<Utc>>,
    pub finalize: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeOutcome {
    Recorded { transaction_id: i64 },
    /// Another writer moved the worker's billing cursor first; nothing written.
    Superseded,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct UsageTotals {
    pub transaction_count: i64,
    pub total_seconds: i64,
    pub total_amount: i64,
}

// ── Database handle ─────────────────────────────────────────────

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to PostgreSQL. Credentials in the URL may be percent-encoded.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let url = url::Url::parse(database_url)?;
        let username = urlencoding::decode(url.username())?.into_owned();
        let password = url
            .password()
            .map(|p| urlencoding::decode(p).map(|s| s.into_owned()))
            .transpose()?;
        let mut opts = PgConnectOptions::new()
            .host(url.host_str().unwrap_or("localhost"))
            .port(url.port().unwrap_or(5432))
            .database(url.path().trim_start_matches('/'))
            .username(&username)
            .statement_cache_capacity(0);
        if let Some(ref pw) = password {
            opts = opts.password(pw);
        }
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(opts)
            .await?;
        Ok(Database { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema. Every statement is idempotent.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    /// Health check: execute `SELECT 1` to verify database connectivity.
    ///
    /// Used by the `/readyz` readiness probe.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_text_round_trips() {
        for s in ["pending", "active", "final_billed"] {
            let parsed: BillingStatus = s.parse().unwrap();
            assert_eq!(parsed.as_str(), s);
        }
        assert_eq!(
            EndpointStatus::try_from("running".to_string()).unwrap(),
            EndpointStatus::Running
        );
    }

    #[test]
    fn unknown_status_is_rejected() {
        let err = "paused".parse::<ClusterStatus>().unwrap_err();
        assert!(err.to_string().contains("cluster"));
        assert!(err.to_string().contains("paused"));
    }

    #[test]
    fn status_serializes_as_snake_case() {
        let json = serde_json::to_string(&BillingStatus::FinalBilled).unwrap();
        assert_eq!(json, "\"final_billed\"");
    }

    #[test]
    fn endpoint_changes_empty() {
        assert!(EndpointChanges::default().is_empty());
        let changes = EndpointChanges {
            replicas: Some(0),
            ..Default::default()
        };
        assert!(!changes.is_empty());
    }

    #[test]
    fn schema_declares_every_table() {
        for table in [
            "clusters",
            "cluster_specs",
            "spec_pricing",
            "user_endpoints",
            "workers",
            "billing_transactions",
        ] {
            assert!(
                SCHEMA_SQL.contains(&format!("CREATE TABLE IF NOT EXISTS {table}")),
                "missing table {table}"
            );
        }
    }
}
