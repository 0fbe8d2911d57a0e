//! Shared test helpers for integration tests.
//!
//! [`MemStore`] implements the persistence contract in memory with the same
//! conditional-update semantics as the PostgreSQL store, so the control loops
//! run unchanged. [`FakeCluster`] stands in for a remote execution cluster:
//! it serves canned payloads, records every call and fails on request.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};
use sqlx::types::Json;

use fleetmeter::api::AppState;
use fleetmeter::balance::BalanceAuthority;
use fleetmeter::cluster_client::{
    AutoscalerConfig, ClientFactory, ClientRegistry, ClusterApi, CreateEndpointRequest,
    DeploymentUpdate,
};
use fleetmeter::db::{
    BillingStatus, BillingTransactionRow, BillingTransactionView, ChargeOutcome, ClusterRow,
    ClusterSpecRow, ClusterStatus, EndpointChanges, EndpointRow, EndpointStatus, EnvVars,
    LedgerCharge, NewEndpoint, NewWorker, SpecPricingRow, TransactionStatus, UsageTotals,
    WorkerObservation, WorkerRow,
};
use fleetmeter::endpoint_sync::EndpointSync;
use fleetmeter::error::{FleetError, RemoteError};
use fleetmeter::lifecycle::{EndpointManager, EndpointScaler};
use fleetmeter::metering::MeteringTrigger;
use fleetmeter::prom_metrics::Metrics;
use fleetmeter::reconciler::WorkerReconciler;
use fleetmeter::settlement::{BillingMessage, SettlementPublisher};
use fleetmeter::store::FleetStore;

/// Fixed reference instant for deterministic timelines.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
}

pub fn at(secs: i64) -> DateTime<Utc> {
    t0() + chrono::Duration::seconds(secs)
}

// ── Row builders ────────────────────────────────────────────────

pub fn cluster(cluster_id: &str, region: &str, priority: i32) -> ClusterRow {
    ClusterRow {
        cluster_id: cluster_id.to_string(),
        cluster_name: format!("{cluster_id} cluster"),
        region: region.to_string(),
        api_endpoint: format!("http://{cluster_id}.invalid"),
        api_key: format!("key-{cluster_id}"),
        status: ClusterStatus::Active,
        priority,
        last_heartbeat_at: Some(t0()),
        created_at: t0(),
        updated_at: t0(),
    }
}

pub fn cluster_spec(cluster_id: &str, spec_name: &str, available: i32, total: i32) -> ClusterSpecRow {
    ClusterSpecRow {
        id: 0,
        cluster_id: cluster_id.to_string(),
        cluster_spec_name: format!("{cluster_id}-{}", spec_name.to_lowercase()),
        spec_name: spec_name.to_string(),
        total_capacity: total,
        available_capacity: available,
        is_available: true,
    }
}

pub fn pricing(spec_name: &str, price_per_hour: i64) -> SpecPricingRow {
    SpecPricingRow {
        spec_name: spec_name.to_string(),
        spec_type: "GPU".to_string(),
        gpu_type: Some("A100".to_string()),
        gpu_count: 1,
        cpu_cores: 8,
        ram_gb: 64,
        disk_gb: Some(100),
        price_per_hour,
        currency: "USD".to_string(),
        is_available: true,
    }
}

pub fn endpoint(user_id: &str, logical_name: &str, cluster_id: &str, price_per_hour: i64) -> EndpointRow {
    EndpointRow {
        id: 0,
        user_id: user_id.to_string(),
        org_id: format!("org-{user_id}"),
        logical_name: logical_name.to_string(),
        physical_name: logical_name.to_lowercase(),
        spec_name: "GPU-A100-40GB".to_string(),
        spec_type: "GPU".to_string(),
        gpu_type: Some("A100".to_string()),
        gpu_count: 1,
        cpu_cores: 8,
        ram_gb: 64,
        cluster_id: cluster_id.to_string(),
        replicas: 1,
        min_replicas: 0,
        max_replicas: 3,
        current_replicas: 0,
        image: "registry.invalid/model:1".to_string(),
        task_timeout: 600,
        env: Json(EnvVars::new()),
        price_per_hour,
        currency: "USD".to_string(),
        prefer_region: None,
        status: EndpointStatus::Running,
        created_at: t0(),
        updated_at: t0(),
        deleted_at: None,
    }
}

/// A started worker with billing active since `started_at`.
pub fn worker(worker_id: &str, endpoint: &EndpointRow, started_at: DateTime<Utc>) -> WorkerRow {
    WorkerRow {
        id: 0,
        worker_id: worker_id.to_string(),
        endpoint_id: endpoint.id,
        cluster_id: endpoint.cluster_id.clone(),
        user_id: endpoint.user_id.clone(),
        pod_name: Some(format!("{worker_id}-pod")),
        status: "RUNNING".to_string(),
        pod_created_at: Some(started_at),
        pod_started_at: Some(started_at),
        pod_ready_at: None,
        pod_terminated_at: None,
        cold_start_duration_ms: None,
        current_jobs: 0,
        total_tasks_completed: 0,
        total_tasks_failed: 0,
        last_task_time: None,
        last_heartbeat: None,
        billing_status: BillingStatus::Active,
        last_billed_at: Some(started_at),
        total_billed_seconds: 0,
        total_billed_amount: 0,
        last_synced_at: None,
        created_at: started_at,
        updated_at: started_at,
    }
}

/// Remote worker payload in the cluster's camelCase shape.
pub fn remote_worker(id: &str, status: &str, started_at: Option<DateTime<Utc>>) -> Value {
    let mut v = json!({
        "id": id,
        "status": status,
        "podName": format!("{id}-pod"),
        "currentJobs": 1,
        "totalTasksCompleted": "4",
        "totalTasksFailed": 0,
    });
    if let Some(s) = started_at {
        v["podStartedAt"] = json!(s.to_rfc3339());
        v["lastHeartbeat"] = json!(s.to_rfc3339());
    }
    v
}

// ── In-memory store ─────────────────────────────────────────────

#[derive(Default)]
struct MemState {
    next_id: i64,
    clusters: BTreeMap<String, ClusterRow>,
    cluster_specs: Vec<ClusterSpecRow>,
    pricing: BTreeMap<String, SpecPricingRow>,
    endpoints: Vec<EndpointRow>,
    workers: BTreeMap<String, WorkerRow>,
    transactions: Vec<BillingTransactionRow>,
}

impl MemState {
    fn id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn endpoint_mut(&mut self, id: i64) -> Result<&mut EndpointRow> {
        self.endpoints
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| anyhow!("endpoint {id} not found"))
    }
}

#[derive(Default)]
pub struct MemStore {
    state: Mutex<MemState>,
    /// Makes `insert_endpoint` fail, for compensation paths.
    pub fail_endpoint_insert: AtomicBool,
    /// Makes `record_charge` fail.
    pub fail_record_charge: AtomicBool,
}

impl MemStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemState> {
        self.state.lock().unwrap()
    }

    pub fn add_cluster(&self, cluster: ClusterRow) {
        self.lock().clusters.insert(cluster.cluster_id.clone(), cluster);
    }

    pub fn add_cluster_spec(&self, mut spec: ClusterSpecRow) {
        let mut state = self.lock();
        spec.id = state.id();
        state.cluster_specs.push(spec);
    }

    pub fn add_pricing(&self, row: SpecPricingRow) {
        self.lock().pricing.insert(row.spec_name.clone(), row);
    }

    /// Store the endpoint under a fresh id and return the stored row.
    pub fn add_endpoint(&self, mut endpoint: EndpointRow) -> EndpointRow {
        let mut state = self.lock();
        endpoint.id = state.id();
        state.endpoints.push(endpoint.clone());
        endpoint
    }

    pub fn add_worker(&self, mut worker: WorkerRow) -> WorkerRow {
        let mut state = self.lock();
        worker.id = state.id();
        state.workers.insert(worker.worker_id.clone(), worker.clone());
        worker
    }

    pub fn worker(&self, worker_id: &str) -> Option<WorkerRow> {
        self.lock().workers.get(worker_id).cloned()
    }

    pub fn edit_worker(&self, worker_id: &str, f: impl FnOnce(&mut WorkerRow)) {
        if let Some(w) = self.lock().workers.get_mut(worker_id) {
            f(w);
        }
    }

    pub fn endpoints(&self) -> Vec<EndpointRow> {
        self.lock().endpoints.clone()
    }

    pub fn cluster_status(&self, cluster_id: &str) -> Option<ClusterStatus> {
        self.lock().clusters.get(cluster_id).map(|c| c.status)
    }

    pub fn transactions(&self) -> Vec<BillingTransactionRow> {
        self.lock().transactions.clone()
    }
}

#[async_trait]
impl FleetStore for MemStore {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn get_cluster(&self, cluster_id: &str) -> Result<Option<ClusterRow>> {
        Ok(self.lock().clusters.get(cluster_id).cloned())
    }

    async fn record_cluster_heartbeat(&self, cluster_id: &str, at: DateTime<Utc>) -> Result<bool> {
        let mut state = self.lock();
        let Some(c) = state.clusters.get_mut(cluster_id) else {
            return Ok(false);
        };
        c.last_heartbeat_at = Some(at);
        c.status = ClusterStatus::Active;
        Ok(true)
    }

    async fn mark_stale_clusters_offline(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        let mut state = self.lock();
        let mut ids = Vec::new();
        for c in state.clusters.values_mut() {
            if c.status == ClusterStatus::Active && c.last_heartbeat_at.is_some_and(|h| h < cutoff) {
                c.status = ClusterStatus::Offline;
                ids.push(c.cluster_id.clone());
            }
        }
        Ok(ids)
    }

    async fn get_spec_pricing(&self, spec_name: &str) -> Result<Option<SpecPricingRow>> {
        Ok(self.lock().pricing.get(spec_name).cloned())
    }

    async fn list_available_cluster_specs(&self, spec_name: &str) -> Result<Vec<ClusterSpecRow>> {
        let mut rows: Vec<_> = self
            .lock()
            .cluster_specs
            .iter()
            .filter(|s| s.spec_name == spec_name && s.is_available && s.available_capacity > 0)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.cluster_id.cmp(&b.cluster_id).then(a.id.cmp(&b.id)));
        Ok(rows)
    }

    async fn insert_endpoint(&self, ep: &NewEndpoint) -> Result<EndpointRow> {
        if self.fail_endpoint_insert.load(Ordering::SeqCst) {
            return Err(anyhow!("injected insert failure"));
        }
        let mut state = self.lock();
        if state
            .endpoints
            .iter()
            .any(|e| {
                e.user_id == ep.user_id
                    && e.deleted_at.is_none()
                    && (e.logical_name == ep.logical_name || e.physical_name == ep.physical_name)
            })
        {
            return Err(anyhow!("duplicate key value violates unique constraint"));
        }
        let row = EndpointRow {
            id: state.id(),
            user_id: ep.user_id.clone(),
            org_id: ep.org_id.clone(),
            logical_name: ep.logical_name.clone(),
            physical_name: ep.physical_name.clone(),
            spec_name: ep.spec_name.clone(),
            spec_type: ep.spec_type.clone(),
            gpu_type: ep.gpu_type.clone(),
            gpu_count: ep.gpu_count,
            cpu_cores: ep.cpu_cores,
            ram_gb: ep.ram_gb,
            cluster_id: ep.cluster_id.clone(),
            replicas: ep.replicas,
            min_replicas: ep.min_replicas,
            max_replicas: ep.max_replicas,
            current_replicas: 0,
            image: ep.image.clone(),
            task_timeout: ep.task_timeout,
            env: Json(ep.env.clone()),
            price_per_hour: ep.price_per_hour,
            currency: ep.currency.clone(),
            prefer_region: ep.prefer_region.clone(),
            status: EndpointStatus::Deploying,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
        };
        state.endpoints.push(row.clone());
        Ok(row)
    }

    async fn get_endpoint(&self, id: i64) -> Result<Option<EndpointRow>> {
        Ok(self.lock().endpoints.iter().find(|e| e.id == id).cloned())
    }

    async fn find_endpoint(&self, user_id: &str, logical_name: &str) -> Result<Option<EndpointRow>> {
        Ok(self
            .lock()
            .endpoints
            .iter()
            .find(|e| e.user_id == user_id && e.logical_name == logical_name && e.deleted_at.is_none())
            .cloned())
    }

    async fn list_user_endpoints(&self, user_id: &str) -> Result<Vec<EndpointRow>> {
        let mut rows: Vec<_> = self
            .lock()
            .endpoints
            .iter()
            .filter(|e| e.user_id == user_id && e.deleted_at.is_none())
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(rows)
    }

    async fn list_reconcilable_endpoints(&self) -> Result<Vec<EndpointRow>> {
        Ok(self
            .lock()
            .endpoints
            .iter()
            .filter(|e| {
                e.deleted_at.is_none()
                    && matches!(e.status, EndpointStatus::Running | EndpointStatus::Deploying)
            })
            .cloned()
            .collect())
    }

    async fn list_live_endpoints(&self) -> Result<Vec<EndpointRow>> {
        Ok(self
            .lock()
            .endpoints
            .iter()
            .filter(|e| e.deleted_at.is_none())
            .cloned()
            .collect())
    }

    async fn set_endpoint_status(&self, id: i64, status: EndpointStatus) -> Result<()> {
        self.lock().endpoint_mut(id)?.status = status;
        Ok(())
    }

    async fn apply_endpoint_changes(&self, id: i64, changes: &EndpointChanges) -> Result<()> {
        let mut state = self.lock();
        let e = state.endpoint_mut(id)?;
        if let Some(v) = changes.replicas {
            e.replicas = v;
        }
        if let Some(v) = changes.current_replicas {
            e.current_replicas = v;
        }
        if let Some(v) = changes.min_replicas {
            e.min_replicas = v;
        }
        if let Some(v) = changes.max_replicas {
            e.max_replicas = v;
        }
        if let Some(v) = changes.task_timeout {
            e.task_timeout = v;
        }
        if let Some(v) = &changes.image {
            e.image = v.clone();
        }
        if let Some(v) = &changes.env {
            e.env = Json(v.clone());
        }
        Ok(())
    }

    async fn soft_delete_endpoint(&self, id: i64) -> Result<()> {
        let mut state = self.lock();
        let e = state.endpoint_mut(id)?;
        if e.deleted_at.is_none() {
            e.status = EndpointStatus::Deleted;
            e.deleted_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn get_worker(&self, worker_id: &str) -> Result<Option<WorkerRow>> {
        Ok(self.worker(worker_id))
    }

    async fn list_endpoint_workers(&self, endpoint_id: i64) -> Result<Vec<WorkerRow>> {
        Ok(self
            .lock()
            .workers
            .values()
            .filter(|w| w.endpoint_id == endpoint_id)
            .cloned()
            .collect())
    }

    async fn insert_worker(&self, w: &NewWorker) -> Result<bool> {
        let mut state = self.lock();
        if state.workers.contains_key(&w.worker_id) {
            return Ok(false);
        }
        let id = state.id();
        let now = Utc::now();
        state.workers.insert(
            w.worker_id.clone(),
            WorkerRow {
                id,
                worker_id: w.worker_id.clone(),
                endpoint_id: w.endpoint_id,
                cluster_id: w.cluster_id.clone(),
                user_id: w.user_id.clone(),
                pod_name: w.pod_name.clone(),
                status: w.status.clone(),
                pod_created_at: w.pod_created_at,
                pod_started_at: w.pod_started_at,
                pod_ready_at: w.pod_ready_at,
                pod_terminated_at: None,
                cold_start_duration_ms: w.cold_start_duration_ms,
                current_jobs: w.current_jobs,
                total_tasks_completed: w.total_tasks_completed,
                total_tasks_failed: w.total_tasks_failed,
                last_task_time: w.last_task_time,
                last_heartbeat: w.last_heartbeat,
                billing_status: w.billing_status,
                last_billed_at: w.last_billed_at,
                total_billed_seconds: 0,
                total_billed_amount: 0,
                last_synced_at: Some(now),
                created_at: now,
                updated_at: now,
            },
        );
        Ok(true)
    }

    async fn update_worker_observation(&self, worker_id: &str, obs: &WorkerObservation) -> Result<()> {
        let mut state = self.lock();
        if let Some(w) = state.workers.get_mut(worker_id) {
            if let Some(s) = &obs.status {
                w.status = s.clone();
            }
            if let Some(p) = &obs.pod_name {
                w.pod_name = Some(p.clone());
            }
            w.current_jobs = obs.current_jobs;
            w.total_tasks_completed = obs.total_tasks_completed;
            w.total_tasks_failed = obs.total_tasks_failed;
            w.pod_ready_at = w.pod_ready_at.or(obs.pod_ready_at);
            w.last_heartbeat = obs.last_heartbeat.or(w.last_heartbeat);
            w.last_task_time = obs.last_task_time.or(w.last_task_time);
            w.last_synced_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn activate_worker_billing(&self, worker_id: &str, started_at: DateTime<Utc>) -> Result<bool> {
        let mut state = self.lock();
        match state.workers.get_mut(worker_id) {
            Some(w) if w.pod_started_at.is_none() && w.billing_status == BillingStatus::Pending => {
                w.pod_started_at = Some(started_at);
                w.billing_status = BillingStatus::Active;
                w.last_billed_at = Some(started_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_unterminated_workers(&self, endpoint_id: i64) -> Result<Vec<WorkerRow>> {
        Ok(self
            .lock()
            .workers
            .values()
            .filter(|w| w.endpoint_id == endpoint_id && !w.is_offline())
            .cloned()
            .collect())
    }

    async fn mark_worker_offline(&self, worker_id: &str, terminated_at: DateTime<Utc>) -> Result<()> {
        let mut state = self.lock();
        if let Some(w) = state.workers.get_mut(worker_id) {
            w.status = "OFFLINE".to_string();
            w.pod_terminated_at = w.pod_terminated_at.or(Some(terminated_at));
        }
        Ok(())
    }

    async fn list_billable_workers(&self) -> Result<Vec<WorkerRow>> {
        Ok(self
            .lock()
            .workers
            .values()
            .filter(|w| w.is_billable())
            .cloned()
            .collect())
    }

    async fn finalize_worker(&self, worker_id: &str) -> Result<bool> {
        let mut state = self.lock();
        match state.workers.get_mut(worker_id) {
            Some(w) if w.billing_status == BillingStatus::Active => {
                w.billing_status = BillingStatus::FinalBilled;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_charge(&self, charge: &LedgerCharge) -> Result<ChargeOutcome> {
        if self.fail_record_charge.load(Ordering::SeqCst) {
            return Err(anyhow!("injected ledger failure"));
        }
        let t = &charge.transaction;
        let mut state = self.lock();
        if state
            .transactions
            .iter()
            .any(|r| r.worker_id == t.worker_id && r.billing_period_start == t.billing_period_start)
        {
            return Ok(ChargeOutcome::Superseded);
        }
        let applies = state.workers.get(&t.worker_id).is_some_and(|w| {
            w.billing_status == BillingStatus::Active
                && w.last_billed_at == charge.expected_last_billed_at
        });
        if !applies {
            return Ok(ChargeOutcome::Superseded);
        }

        let transaction_id = state.id();
        state.transactions.push(BillingTransactionRow {
            id: transaction_id,
            user_id: t.user_id.clone(),
            org_id: t.org_id.clone(),
            endpoint_id: t.endpoint_id,
            cluster_id: t.cluster_id.clone(),
            worker_id: t.worker_id.clone(),
            gpu_type: t.gpu_type.clone(),
            gpu_count: t.gpu_count,
            billing_period_start: t.billing_period_start,
            billing_period_end: t.billing_period_end,
            duration_seconds: t.duration_seconds,
            price_per_hour: t.price_per_hour,
            amount: t.amount,
            status: TransactionStatus::Success,
            error_message: None,
            created_at: Utc::now(),
        });
        if let Some(w) = state.workers.get_mut(&t.worker_id) {
            w.last_billed_at = Some(t.billing_period_end);
            w.total_billed_seconds += t.duration_seconds;
            w.total_billed_amount += t.amount;
            if charge.finalize {
                w.billing_status = BillingStatus::FinalBilled;
            }
        }
        Ok(ChargeOutcome::Recorded { transaction_id })
    }

    async fn list_worker_transactions(&self, worker_id: &str) -> Result<Vec<BillingTransactionRow>> {
        let mut rows: Vec<_> = self
            .lock()
            .transactions
            .iter()
            .filter(|t| t.worker_id == worker_id)
            .cloned()
            .collect();
        rows.sort_by_key(|t| t.billing_period_start);
        Ok(rows)
    }

    async fn list_user_transactions(
        &self,
        user_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<BillingTransactionView>> {
        let state = self.lock();
        let mut rows: Vec<_> = state
            .transactions
            .iter()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(rows
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .map(|transaction| {
                let ep = state.endpoints.iter().find(|e| e.id == transaction.endpoint_id);
                BillingTransactionView {
                    logical_name: ep.map(|e| e.logical_name.clone()),
                    spec_name: ep.map(|e| e.spec_name.clone()),
                    transaction,
                }
            })
            .collect())
    }

    async fn usage_totals(
        &self,
        user_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<UsageTotals> {
        let state = self.lock();
        let mut totals = UsageTotals::default();
        for t in state.transactions.iter().filter(|t| {
            t.user_id == user_id
                && t.status == TransactionStatus::Success
                && t.billing_period_start >= from
                && t.billing_period_start < to
        }) {
            totals.transaction_count += 1;
            totals.total_seconds += t.duration_seconds;
            totals.total_amount += t.amount;
        }
        Ok(totals)
    }
}

// ── Fake cluster ────────────────────────────────────────────────

#[derive(Default)]
struct FakeState {
    endpoints: HashMap<String, Value>,
    workers: HashMap<String, Vec<Value>>,
    worker_details: HashMap<String, Value>,
    failing: HashSet<&'static str>,
    missing: HashSet<&'static str>,
    calls: Vec<String>,
}

/// Scriptable [`ClusterApi`]. Operation names used for failure injection:
/// `create`, `get_endpoint`, `delete`, `update_deployment`,
/// `update_autoscaler`, `list_workers`, `get_worker`.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<FakeState>,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Make `op` fail with a 500.
    pub fn fail(&self, op: &'static str) {
        self.lock().failing.insert(op);
    }

    /// Make `op` fail with a 404.
    pub fn not_found(&self, op: &'static str) {
        self.lock().missing.insert(op);
    }

    pub fn heal(&self) {
        let mut s = self.lock();
        s.failing.clear();
        s.missing.clear();
    }

    pub fn set_endpoint(&self, name: &str, detail: Value) {
        self.lock().endpoints.insert(name.to_string(), detail);
    }

    pub fn set_workers(&self, endpoint: &str, workers: Vec<Value>) {
        self.lock().workers.insert(endpoint.to_string(), workers);
    }

    pub fn set_worker_detail(&self, worker_id: &str, detail: Value) {
        self.lock().worker_details.insert(worker_id.to_string(), detail);
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.lock().calls.iter().filter(|c| c.starts_with(prefix)).count()
    }

    fn call(&self, op: &'static str, target: &str) -> Result<(), RemoteError> {
        let mut s = self.lock();
        s.calls.push(format!("{op} {target}"));
        if s.failing.contains(op) {
            return Err(RemoteError::Status {
                status: 500,
                body: format!("injected {op} failure"),
            });
        }
        if s.missing.contains(op) {
            return Err(RemoteError::Status {
                status: 404,
                body: "not found".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn create_endpoint(&self, req: &CreateEndpointRequest) -> Result<(), RemoteError> {
        self.call("create", &req.endpoint)?;
        self.lock().endpoints.insert(
            req.endpoint.clone(),
            json!({"status": "deploying", "replicas": req.replicas, "readyReplicas": 0, "image": req.image}),
        );
        Ok(())
    }

    async fn get_endpoint(&self, name: &str) -> Result<Value, RemoteError> {
        self.call("get_endpoint", name)?;
        self.lock().endpoints.get(name).cloned().ok_or(RemoteError::Status {
            status: 404,
            body: "not found".to_string(),
        })
    }

    async fn delete_endpoint(&self, name: &str) -> Result<(), RemoteError> {
        self.call("delete", name)?;
        self.lock().endpoints.remove(name);
        Ok(())
    }

    async fn update_deployment(&self, name: &str, update: &DeploymentUpdate) -> Result<(), RemoteError> {
        self.call("update_deployment", name)?;
        if let (Some(r), Some(ep)) = (update.replicas, self.lock().endpoints.get_mut(name)) {
            ep["replicas"] = json!(r);
        }
        Ok(())
    }

    async fn update_autoscaler(&self, name: &str, _config: &AutoscalerConfig) -> Result<(), RemoteError> {
        self.call("update_autoscaler", name)
    }

    async fn list_endpoint_workers(&self, name: &str) -> Result<Value, RemoteError> {
        self.call("list_workers", name)?;
        let workers = self.lock().workers.get(name).cloned().unwrap_or_default();
        Ok(json!({ "workers": workers }))
    }

    async fn get_worker(&self, worker_id: &str) -> Result<Value, RemoteError> {
        self.call("get_worker", worker_id)?;
        self.lock()
            .worker_details
            .get(worker_id)
            .cloned()
            .ok_or(RemoteError::Status {
                status: 404,
                body: "worker not found".to_string(),
            })
    }
}

/// Registry that hands out `fake` for every cluster.
pub fn registry(fake: Arc<FakeCluster>) -> Arc<ClientRegistry> {
    let factory: ClientFactory = Arc::new(move |_: &ClusterRow| fake.clone() as Arc<dyn ClusterApi>);
    Arc::new(ClientRegistry::with_factory(factory))
}

/// Registry with one fake per cluster id. Unknown clusters get a fake that
/// fails every call.
pub fn registry_per_cluster(fakes: Vec<(&str, Arc<FakeCluster>)>) -> Arc<ClientRegistry> {
    let map: HashMap<String, Arc<FakeCluster>> = fakes
        .into_iter()
        .map(|(id, f)| (id.to_string(), f))
        .collect();
    let factory: ClientFactory = Arc::new(move |cluster: &ClusterRow| {
        let fake = map.get(&cluster.cluster_id).cloned().unwrap_or_else(|| {
            let broken = FakeCluster::new();
            for op in [
                "create",
                "get_endpoint",
                "delete",
                "update_deployment",
                "update_autoscaler",
                "list_workers",
                "get_worker",
            ] {
                broken.fail(op);
            }
            broken
        });
        fake as Arc<dyn ClusterApi>
    });
    Arc::new(ClientRegistry::with_factory(factory))
}

// ── Billing collaborators ───────────────────────────────────────

#[derive(Default)]
pub struct RecordingPublisher {
    pub messages: Mutex<Vec<BillingMessage>>,
    pub fail: AtomicBool,
}

impl RecordingPublisher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn messages(&self) -> Vec<BillingMessage> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl SettlementPublisher for RecordingPublisher {
    async fn publish(&self, message: &BillingMessage) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("stream unavailable"));
        }
        self.messages.lock().unwrap().push(message.clone());
        Ok(())
    }
}

/// Balance authority answering the same total for every organization.
/// `None` simulates an unreachable authority.
pub struct FixedBalance(pub Option<i64>);

#[async_trait]
impl BalanceAuthority for FixedBalance {
    async fn total_available(&self, _org_id: &str) -> Result<i64, RemoteError> {
        self.0
            .ok_or_else(|| RemoteError::Connect("balance authority unreachable".to_string()))
    }
}

#[derive(Default)]
pub struct RecordingScaler {
    pub calls: Mutex<Vec<(i64, i32)>>,
}

impl RecordingScaler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<(i64, i32)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl EndpointScaler for RecordingScaler {
    async fn scale_endpoint(&self, endpoint: &EndpointRow, replicas: i32) -> Result<(), FleetError> {
        self.calls.lock().unwrap().push((endpoint.id, replicas));
        Ok(())
    }
}

// ── App wiring ──────────────────────────────────────────────────

pub struct TestApp {
    pub store: Arc<MemStore>,
    pub fake: Arc<FakeCluster>,
    pub state: Arc<AppState>,
    pub triggers: tokio::sync::mpsc::Receiver<String>,
}

impl TestApp {
    pub fn router(&self) -> axum::Router {
        fleetmeter::api::build_router(self.state.clone())
    }
}

/// API state over an in-memory store and one fake cluster.
pub fn test_app(store: Arc<MemStore>, fake: Arc<FakeCluster>) -> TestApp {
    let metrics = Arc::new(Metrics::new());
    let clients = registry(fake.clone());
    let dyn_store: Arc<dyn FleetStore> = store.clone();
    let manager = Arc::new(EndpointManager::new(dyn_store.clone(), clients.clone(), metrics.clone()));
    let (metering, triggers) = MeteringTrigger::channel(16);
    let state = Arc::new(AppState {
        store: dyn_store.clone(),
        manager,
        reconciler: WorkerReconciler::new(dyn_store.clone(), clients.clone(), metrics.clone()),
        endpoint_sync: EndpointSync::new(dyn_store, clients, metrics.clone()),
        metering,
        prom_metrics: metrics,
    });
    TestApp {
        store,
        fake,
        state,
        triggers,
    }
}

/// One active cluster with capacity and pricing for `GPU-A100-40GB`.
pub fn seeded_store() -> Arc<MemStore> {
    let store = MemStore::new();
    store.add_cluster(cluster("c-east", "us-east", 100));
    store.add_cluster_spec(cluster_spec("c-east", "GPU-A100-40GB", 5, 10));
    store.add_pricing(pricing("GPU-A100-40GB", 3_600_000_000));
    store
}

// ── PostgreSQL ──────────────────────────────────────────────────

/// Returns the test database URL from the `TEST_DATABASE_URL` environment variable.
/// Panics if the variable is not set.
pub fn test_db_url() -> String {
    std::env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL must be set for integration tests")
}

/// Returns true if the test database URL is configured.
pub fn has_test_db() -> bool {
    std::env::var("TEST_DATABASE_URL").is_ok()
}

static SCHEMA_INIT: Once = Once::new();

/// Ensure the test database schema is set up (runs once per test binary).
pub fn ensure_schema() {
    SCHEMA_INIT.call_once(|| {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let db = fleetmeter::db::Database::connect(&test_db_url(), 2).await.unwrap();
            db.migrate().await.unwrap();
        });
    });
}

/// Connect to the test database with empty tables.
pub async fn setup_test_db() -> fleetmeter::db::Database {
    ensure_schema();
    let db = fleetmeter::db::Database::connect(&test_db_url(), 4)
        .await
        .expect("Failed to connect to test database");
    truncate_all_tables(db.pool()).await;
    db
}

pub async fn truncate_all_tables(pool: &sqlx::PgPool) {
    sqlx::raw_sql(
        "TRUNCATE TABLE billing_transactions, workers, user_endpoints, cluster_specs,
                        spec_pricing, clusters
         RESTART IDENTITY CASCADE",
    )
    .execute(pool)
    .await
    .unwrap();
}
