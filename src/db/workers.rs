//! Worker rows as reconciled from the execution clusters.
//!
//! The reconciler is the only caller that writes status, counters and
//! `pod_terminated_at`. Billing columns other than the first-time activation
//! are written by the ledger transaction in [`super::billing`].

use super::{Database, NewWorker, WorkerObservation, WorkerRow};
use anyhow::Result;
use chrono::{DateTime, Utc};

const WORKER_COLUMNS: &str = "id, worker_id, endpoint_id, cluster_id, user_id, pod_name, status,
     pod_created_at, pod_started_at, pod_ready_at, pod_terminated_at, cold_start_duration_ms,
     current_jobs, total_tasks_completed, total_tasks_failed, last_task_time, last_heartbeat,
     billing_status, last_billed_at, total_billed_seconds, total_billed_amount, last_synced_at,
     created_at, updated_at";

impl Database {
    pub async fn get_worker(&self, worker_id: &str) -> Result<Option<WorkerRow>> {
        let row = sqlx::query_as::<_, WorkerRow>(&format!(
            "SELECT {WORKER_COLUMNS} FROM workers WHERE worker_id = $1"
        ))
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list_endpoint_workers(&self, endpoint_id: i64) -> Result<Vec<WorkerRow>> {
        let rows = sqlx::query_as::<_, WorkerRow>(&format!(
            "SELECT {WORKER_COLUMNS} FROM workers WHERE endpoint_id = $1 ORDER BY created_at"
        ))
        .bind(endpoint_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Insert a newly observed worker. Returns false if a row with the same
    /// `worker_id` already exists (a concurrent pass got there first).
    pub async fn insert_worker(&self, w: &NewWorker) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO workers (worker_id, endpoint_id, cluster_id, user_id, pod_name, status,
                 pod_created_at, pod_started_at, pod_ready_at, cold_start_duration_ms,
                 current_jobs, total_tasks_completed, total_tasks_failed, last_task_time,
                 last_heartbeat, billing_status, last_billed_at, last_synced_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, NOW())
             ON CONFLICT (worker_id) DO NOTHING",
        )
        .bind(&w.worker_id)
        .bind(w.endpoint_id)
        .bind(&w.cluster_id)
        .bind(&w.user_id)
        .bind(&w.pod_name)
        .bind(&w.status)
        .bind(w.pod_created_at)
        .bind(w.pod_started_at)
        .bind(w.pod_ready_at)
        .bind(w.cold_start_duration_ms)
        .bind(w.current_jobs)
        .bind(w.total_tasks_completed)
        .bind(w.total_tasks_failed)
        .bind(w.last_task_time)
        .bind(w.last_heartbeat)
        .bind(w.billing_status.as_str())
        .bind(w.last_billed_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn update_worker_observation(
        &self,
        worker_id: &str,
        obs: &WorkerObservation,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE workers SET
               status = COALESCE($2, status),
               pod_name = COALESCE($3, pod_name),
               current_jobs = $4,
               total_tasks_completed = $5,
               total_tasks_failed = $6,
               pod_ready_at = COALESCE(pod_ready_at, $7),
               last_heartbeat = COALESCE($8, last_heartbeat),
               last_task_time = COALESCE($9, last_task_time),
               last_synced_at = NOW(),
               updated_at = NOW()
             WHERE worker_id = $1",
        )
        .bind(worker_id)
        .bind(&obs.status)
        .bind(&obs.pod_name)
        .bind(obs.current_jobs)
        .bind(obs.total_tasks_completed)
        .bind(obs.total_tasks_failed)
        .bind(obs.pod_ready_at)
        .bind(obs.last_heartbeat)
        .bind(obs.last_task_time)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// First-time activation: record `pod_started_at` and open billing at
    /// that instant. Only applies to rows that have never started.
    pub async fn activate_worker_billing(
        &self,
        worker_id: &str,
        started_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE workers SET
               pod_started_at = $2,
               billing_status = 'active',
               last_billed_at = $2,
               updated_at = NOW()
             WHERE worker_id = $1 AND pod_started_at IS NULL AND billing_status = 'pending'",
        )
        .bind(worker_id)
        .bind(started_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Workers of an endpoint that have not been seen offline yet.
    pub async fn list_unterminated_workers(&self, endpoint_id: i64) -> Result<Vec<WorkerRow>> {
        let rows = sqlx::query_as::<_, WorkerRow>(&format!(
            "SELECT {WORKER_COLUMNS} FROM workers
             WHERE endpoint_id = $1 AND UPPER(status) <> 'OFFLINE'
             ORDER BY worker_id"
        ))
        .bind(endpoint_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Mark a worker OFFLINE. An already recorded termination time is kept.
    pub async fn mark_worker_offline(
        &self,
        worker_id: &str,
        terminated_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE workers SET
               status = 'OFFLINE',
               pod_terminated_at = COALESCE(pod_terminated_at, $2),
               last_synced_at = NOW(),
               updated_at = NOW()
             WHERE worker_id = $1",
        )
        .bind(worker_id)
        .bind(terminated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Workers eligible for a metering cycle.
    pub async fn list_billable_workers(&self) -> Result<Vec<WorkerRow>> {
        let rows = sqlx::query_as::<_, WorkerRow>(&format!(
            "SELECT {WORKER_COLUMNS} FROM workers
             WHERE billing_status = 'active' AND pod_started_at IS NOT NULL
             ORDER BY worker_id"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Close out a terminated worker that owes nothing more.
    pub async fn finalize_worker(&self, worker_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE workers SET billing_status = 'final_billed', updated_at = NOW()
             WHERE worker_id = $1 AND billing_status = 'active'",
        )
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
