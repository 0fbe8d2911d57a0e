//! # Store: Persistence Contract for the Control Loops
//!
//! The scheduler, lifecycle manager, reconciler, metering engine and health
//! monitor only see [`FleetStore`]. [`Database`] is the production
//! implementation; the integration tests run the same loops against an
//! in-memory store.
//!
//! No in-process locks guard worker or billing rows. Correctness comes from
//! the conditional updates each method documents.

use crate::db::{
    BillingTransactionRow, BillingTransactionView, ChargeOutcome, ClusterRow, ClusterSpecRow,
    Database, EndpointChanges, EndpointRow, EndpointStatus, LedgerCharge, NewEndpoint, NewWorker,
    SpecPricingRow, UsageTotals, WorkerObservation, WorkerRow,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[async_trait]
pub trait FleetStore: Send + Sync {
    async fn ping(&self) -> Result<()>;

    // ── Cluster registry ────────────────────────────────────────

    async fn get_cluster(&self, cluster_id: &str) -> Result<Option<ClusterRow>>;
    async fn record_cluster_heartbeat(&self, cluster_id: &str, at: DateTime<Utc>) -> Result<bool>;
    /// Flip `active` clusters with a heartbeat older than `cutoff` to
    /// `offline`; returns the affected ids.
    async fn mark_stale_clusters_offline(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>>;
    async fn get_spec_pricing(&self, spec_name: &str) -> Result<Option<SpecPricingRow>>;
    /// Capacity rows with `is_available` and `available_capacity > 0`.
    async fn list_available_cluster_specs(&self, spec_name: &str) -> Result<Vec<ClusterSpecRow>>;

    // ── Endpoints ───────────────────────────────────────────────

    async fn insert_endpoint(&self, endpoint: &NewEndpoint) -> Result<EndpointRow>;
    async fn get_endpoint(&self, id: i64) -> Result<Option<EndpointRow>>;
    /// Live (not tombstoned) endpoint by tenant and logical name.
    async fn find_endpoint(&self, user_id: &str, logical_name: &str) -> Result<Option<EndpointRow>>;
    async fn list_user_endpoints(&self, user_id: &str) -> Result<Vec<EndpointRow>>;
    async fn list_reconcilable_endpoints(&self) -> Result<Vec<EndpointRow>>;
    async fn list_live_endpoints(&self) -> Result<Vec<EndpointRow>>;
    async fn set_endpoint_status(&self, id: i64, status: EndpointStatus) -> Result<()>;
    async fn apply_endpoint_changes(&self, id: i64, changes: &EndpointChanges) -> Result<()>;
    async fn soft_delete_endpoint(&self, id: i64) -> Result<()>;

    // ── Workers ─────────────────────────────────────────────────

    async fn get_worker(&self, worker_id: &str) -> Result<Option<WorkerRow>>;
    async fn list_endpoint_workers(&self, endpoint_id: i64) -> Result<Vec<WorkerRow>>;
    /// Returns false if the worker already exists.
    async fn insert_worker(&self, worker: &NewWorker) -> Result<bool>;
    async fn update_worker_observation(&self, worker_id: &str, obs: &WorkerObservation)
        -> Result<()>;
    /// `pending → active` with `last_billed_at = started_at`, only for rows
    /// that never had `pod_started_at`.
    async fn activate_worker_billing(&self, worker_id: &str, started_at: DateTime<Utc>)
        -> Result<bool>;
    async fn list_unterminated_workers(&self, endpoint_id: i64) -> Result<Vec<WorkerRow>>;
    /// Set status OFFLINE; keeps an existing `pod_terminated_at`.
    async fn mark_worker_offline(&self, worker_id: &str, terminated_at: DateTime<Utc>)
        -> Result<()>;
    async fn list_billable_workers(&self) -> Result<Vec<WorkerRow>>;
    /// `active → final_billed` without a ledger row.
    async fn finalize_worker(&self, worker_id: &str) -> Result<bool>;

    // ── Ledger ──────────────────────────────────────────────────

    /// Insert the ledger row and advance the worker atomically, conditional
    /// on `charge.expected_last_billed_at`.
    async fn record_charge(&self, charge: &LedgerCharge) -> Result<ChargeOutcome>;
    async fn list_worker_transactions(&self, worker_id: &str) -> Result<Vec<BillingTransactionRow>>;
    async fn list_user_transactions(
        &self,
        user_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<BillingTransactionView>>;
    async fn usage_totals(
        &self,
        user_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<UsageTotals>;
}

#[async_trait]
impl FleetStore for Database {
    async fn ping(&self) -> Result<()> {
        self.health_check().await
    }

    async fn get_cluster(&self, cluster_id: &str) -> Result<Option<ClusterRow>> {
        Database::get_cluster(self, cluster_id).await
    }

    async fn record_cluster_heartbeat(&self, cluster_id: &str, at: DateTime<Utc>) -> Result<bool> {
        Database::record_cluster_heartbeat(self, cluster_id, at).await
    }

    async fn mark_stale_clusters_offline(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        Database::mark_stale_clusters_offline(self, cutoff).await
    }

    async fn get_spec_pricing(&self, spec_name: &str) -> Result<Option<SpecPricingRow>> {
        Database::get_spec_pricing(self, spec_name).await
    }

    async fn list_available_cluster_specs(&self, spec_name: &str) -> Result<Vec<ClusterSpecRow>> {
        Database::list_available_cluster_specs(self, spec_name).await
    }

    async fn insert_endpoint(&self, endpoint: &NewEndpoint) -> Result<EndpointRow> {
        Database::insert_endpoint(self, endpoint).await
    }

    async fn get_endpoint(&self, id: i64) -> Result<Option<EndpointRow>> {
        Database::get_endpoint(self, id).await
    }

    async fn find_endpoint(&self, user_id: &str, logical_name: &str) -> Result<Option<EndpointRow>> {
        Database::find_endpoint(self, user_id, logical_name).await
    }

    async fn list_user_endpoints(&self, user_id: &str) -> Result<Vec<EndpointRow>> {
        Database::list_user_endpoints(self, user_id).await
    }

    async fn list_reconcilable_endpoints(&self) -> Result<Vec<EndpointRow>> {
        Database::list_reconcilable_endpoints(self).await
    }

    async fn list_live_endpoints(&self) -> Result<Vec<EndpointRow>> {
        Database::list_live_endpoints(self).await
    }

    async fn set_endpoint_status(&self, id: i64, status: EndpointStatus) -> Result<()> {
        Database::set_endpoint_status(self, id, status).await
    }

    async fn apply_endpoint_changes(&self, id: i64, changes: &EndpointChanges) -> Result<()> {
        Database::apply_endpoint_changes(self, id, changes).await
    }

    async fn soft_delete_endpoint(&self, id: i64) -> Result<()> {
        Database::soft_delete_endpoint(self, id).await
    }

    async fn get_worker(&self, worker_id: &str) -> Result<Option<WorkerRow>> {
        Database::get_worker(self, worker_id).await
    }

    async fn list_endpoint_workers(&self, endpoint_id: i64) -> Result<Vec<WorkerRow>> {
        Database::list_endpoint_workers(self, endpoint_id).await
    }

    async fn insert_worker(&self, worker: &NewWorker) -> Result<bool> {
        Database::insert_worker(self, worker).await
    }

    async fn update_worker_observation(
        &self,
        worker_id: &str,
        obs: &WorkerObservation,
    ) -> Result<()> {
        Database::update_worker_observation(self, worker_id, obs).await
    }

    async fn activate_worker_billing(
        &self,
        worker_id: &str,
        started_at: DateTime<Utc>,
    ) -> Result<bool> {
        Database::activate_worker_billing(self, worker_id, started_at).await
    }

    async fn list_unterminated_workers(&self, endpoint_id: i64) -> Result<Vec<WorkerRow>> {
        Database::list_unterminated_workers(self, endpoint_id).await
    }

    async fn mark_worker_offline(
        &self,
        worker_id: &str,
        terminated_at: DateTime<Utc>,
    ) -> Result<()> {
        Database::mark_worker_offline(self, worker_id, terminated_at).await
    }

    async fn list_billable_workers(&self) -> Result<Vec<WorkerRow>> {
        Database::list_billable_workers(self).await
    }

    async fn finalize_worker(&self, worker_id: &str) -> Result<bool> {
        Database::finalize_worker(self, worker_id).await
    }

    async fn record_charge(&self, charge: &LedgerCharge) -> Result<ChargeOutcome> {
        Database::record_charge(self, charge).await
    }

    async fn list_worker_transactions(&self, worker_id: &str) -> Result<Vec<BillingTransactionRow>> {
        Database::list_worker_transactions(self, worker_id).await
    }

    async fn list_user_transactions(
        &self,
        user_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<BillingTransactionView>> {
        Database::list_user_transactions(self, user_id, limit, offset).await
    }

    async fn usage_totals(
        &self,
        user_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<UsageTotals> {
        Database::usage_totals(self, user_id, from, to).await
    }
}
