//! Tenant endpoints: insert, lookup, status and replica bookkeeping.
//!
//! Endpoints are never hard-deleted. Removal sets `deleted_at` and status
//! `deleted`; every lookup here filters tombstones out.

use super::{Database, EndpointChanges, EndpointRow, EndpointStatus, NewEndpoint};
use anyhow::Result;
use sqlx::types::Json;

const ENDPOINT_COLUMNS: &str = "id, user_id, org_id, logical_name, physical_name, spec_name,
     spec_type, gpu_type, gpu_count, cpu_cores, ram_gb, cluster_id, replicas, min_replicas,
     max_replicas, current_replicas, image, task_timeout, env, price_per_hour, currency,
     prefer_region, status, created_at, updated_at, deleted_at";

impl Database {
    pub async fn insert_endpoint(&self, ep: &NewEndpoint) -> Result<EndpointRow> {
        let row = sqlx::query_as::<_, EndpointRow>(&format!(
            "INSERT INTO user_endpoints (user_id, org_id, logical_name, physical_name, spec_name,
                 spec_type, gpu_type, gpu_count, cpu_cores, ram_gb, cluster_id, replicas,
                 min_replicas, max_replicas, image, task_timeout, env, price_per_hour, currency,
                 prefer_region, status)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                     $18, $19, $20, 'deploying')
             RETURNING {ENDPOINT_COLUMNS}"
        ))
        .bind(&ep.user_id)
        .bind(&ep.org_id)
        .bind(&ep.logical_name)
        .bind(&ep.physical_name)
        .bind(&ep.spec_name)
        .bind(&ep.spec_type)
        .bind(&ep.gpu_type)
        .bind(ep.gpu_count)
        .bind(ep.cpu_cores)
        .bind(ep.ram_gb)
        .bind(&ep.cluster_id)
        .bind(ep.replicas)
        .bind(ep.min_replicas)
        .bind(ep.max_replicas)
        .bind(&ep.image)
        .bind(ep.task_timeout)
        .bind(Json(&ep.env))
        .bind(ep.price_per_hour)
        .bind(&ep.currency)
        .bind(&ep.prefer_region)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get_endpoint(&self, id: i64) -> Result<Option<EndpointRow>> {
        let row = sqlx::query_as::<_, EndpointRow>(&format!(
            "SELECT {ENDPOINT_COLUMNS} FROM user_endpoints WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Live endpoint by tenant and logical name.
    pub async fn find_endpoint(
        &self,
        user_id: &str,
        logical_name: &str,
    ) -> Result<Option<EndpointRow>> {
        let row = sqlx::query_as::<_, EndpointRow>(&format!(
            "SELECT {ENDPOINT_COLUMNS} FROM user_endpoints
             WHERE user_id = $1 AND logical_name = $2 AND deleted_at IS NULL"
        ))
        .bind(user_id)
        .bind(logical_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list_user_endpoints(&self, user_id: &str) -> Result<Vec<EndpointRow>> {
        let rows = sqlx::query_as::<_, EndpointRow>(&format!(
            "SELECT {ENDPOINT_COLUMNS} FROM user_endpoints
             WHERE user_id = $1 AND deleted_at IS NULL ORDER BY created_at DESC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Endpoints whose workers are reconciled: `running` or `deploying`.
    pub async fn list_reconcilable_endpoints(&self) -> Result<Vec<EndpointRow>> {
        let rows = sqlx::query_as::<_, EndpointRow>(&format!(
            "SELECT {ENDPOINT_COLUMNS} FROM user_endpoints
             WHERE status IN ('running', 'deploying') AND deleted_at IS NULL
             ORDER BY cluster_id, id"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Every endpoint that is not tombstoned, for the endpoint-state sync.
    pub async fn list_live_endpoints(&self) -> Result<Vec<EndpointRow>> {
        let rows = sqlx::query_as::<_, EndpointRow>(&format!(
            "SELECT {ENDPOINT_COLUMNS} FROM user_endpoints
             WHERE deleted_at IS NULL ORDER BY cluster_id, id"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn set_endpoint_status(&self, id: i64, status: EndpointStatus) -> Result<()> {
        sqlx::query("UPDATE user_endpoints SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn apply_endpoint_changes(&self, id: i64, changes: &EndpointChanges) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        sqlx::query(
            "UPDATE user_endpoints SET
               replicas = COALESCE($2, replicas),
               current_replicas = COALESCE($3, current_replicas),
               min_replicas = COALESCE($4, min_replicas),
               max_replicas = COALESCE($5, max_replicas),
               task_timeout = COALESCE($6, task_timeout),
               image = COALESCE($7, image),
               env = COALESCE($8, env),
               updated_at = NOW()
             WHERE id = $1",
        )
        .bind(id)
        .bind(changes.replicas)
        .bind(changes.current_replicas)
        .bind(changes.min_replicas)
        .bind(changes.max_replicas)
        .bind(changes.task_timeout)
        .bind(&changes.image)
        .bind(changes.env.as_ref().map(Json))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn soft_delete_endpoint(&self, id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE user_endpoints SET status = 'deleted', deleted_at = NOW(), updated_at = NOW()
             WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
