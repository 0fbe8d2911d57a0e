//! Cluster registry, per-cluster capacity rows and spec pricing.
//!
//! Clusters move `active → offline` only through the health sweep
//! ([`Database::mark_stale_clusters_offline`]); a heartbeat flips them back.

use super::{ClusterRow, ClusterSpecRow, Database, NewCluster, NewClusterSpec, SpecPricingRow};
use anyhow::Result;
use chrono::{DateTime, Utc};

const CLUSTER_COLUMNS: &str = "cluster_id, cluster_name, region, api_endpoint, api_key, status,
     priority, last_heartbeat_at, created_at, updated_at";

impl Database {
    pub async fn get_cluster(&self, cluster_id: &str) -> Result<Option<ClusterRow>> {
        let row = sqlx::query_as::<_, ClusterRow>(&format!(
            "SELECT {CLUSTER_COLUMNS} FROM clusters WHERE cluster_id = $1"
        ))
        .bind(cluster_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list_clusters(&self) -> Result<Vec<ClusterRow>> {
        let rows = sqlx::query_as::<_, ClusterRow>(&format!(
            "SELECT {CLUSTER_COLUMNS} FROM clusters ORDER BY cluster_id"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Register or update a cluster's connection info. Status and heartbeat
    /// are left alone on update.
    pub async fn upsert_cluster(&self, cluster: &NewCluster) -> Result<()> {
        sqlx::query(
            "INSERT INTO clusters (cluster_id, cluster_name, region, api_endpoint, api_key, priority)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (cluster_id) DO UPDATE SET
               cluster_name = EXCLUDED.cluster_name, region = EXCLUDED.region,
               api_endpoint = EXCLUDED.api_endpoint, api_key = EXCLUDED.api_key,
               priority = EXCLUDED.priority, updated_at = NOW()",
        )
        .bind(&cluster.cluster_id)
        .bind(&cluster.cluster_name)
        .bind(&cluster.region)
        .bind(&cluster.api_endpoint)
        .bind(&cluster.api_key)
        .bind(cluster.priority)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a heartbeat from a cluster, reactivating it if it was offline.
    /// Returns false when the cluster is unknown.
    pub async fn record_cluster_heartbeat(
        &self,
        cluster_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE clusters SET last_heartbeat_at = $2, status = 'active', updated_at = NOW()
             WHERE cluster_id = $1",
        )
        .bind(cluster_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Mark active clusters whose last heartbeat is older than `cutoff` as
    /// offline. Clusters that never sent a heartbeat are left alone.
    pub async fn mark_stale_clusters_offline(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "UPDATE clusters SET status = 'offline', updated_at = NOW()
             WHERE status = 'active' AND last_heartbeat_at < $1
             RETURNING cluster_id",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    /// Capacity rows for `spec_name` that can take new workloads.
    pub async fn list_available_cluster_specs(&self, spec_name: &str) -> Result<Vec<ClusterSpecRow>> {
        let rows = sqlx::query_as::<_, ClusterSpecRow>(
            "SELECT id, cluster_id, cluster_spec_name, spec_name, total_capacity,
                    available_capacity, is_available
             FROM cluster_specs
             WHERE spec_name = $1 AND is_available AND available_capacity > 0
             ORDER BY cluster_id, id",
        )
        .bind(spec_name)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn upsert_cluster_spec(&self, spec: &NewClusterSpec) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO cluster_specs (cluster_id, cluster_spec_name, spec_name, total_capacity,
                                        available_capacity, is_available)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (cluster_id, cluster_spec_name) DO UPDATE SET
               spec_name = EXCLUDED.spec_name, total_capacity = EXCLUDED.total_capacity,
               available_capacity = EXCLUDED.available_capacity,
               is_available = EXCLUDED.is_available, updated_at = NOW()
             RETURNING id",
        )
        .bind(&spec.cluster_id)
        .bind(&spec.cluster_spec_name)
        .bind(&spec.spec_name)
        .bind(spec.total_capacity)
        .bind(spec.available_capacity)
        .bind(spec.is_available)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn get_spec_pricing(&self, spec_name: &str) -> Result<Option<SpecPricingRow>> {
        let row = sqlx::query_as::<_, SpecPricingRow>(
            "SELECT spec_name, spec_type, gpu_type, gpu_count, cpu_cores, ram_gb, disk_gb,
                    price_per_hour, currency, is_available
             FROM spec_pricing WHERE spec_name = $1",
        )
        .bind(spec_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn upsert_spec_pricing(&self, spec: &SpecPricingRow) -> Result<()> {
        sqlx::query(
            "INSERT INTO spec_pricing (spec_name, spec_type, gpu_type, gpu_count, cpu_cores, ram_gb,
                                       disk_gb, price_per_hour, currency, is_available)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             ON CONFLICT (spec_name) DO UPDATE SET
               spec_type = EXCLUDED.spec_type, gpu_type = EXCLUDED.gpu_type,
               gpu_count = EXCLUDED.gpu_count, cpu_cores = EXCLUDED.cpu_cores,
               ram_gb = EXCLUDED.ram_gb, disk_gb = EXCLUDED.disk_gb,
               price_per_hour = EXCLUDED.price_per_hour, currency = EXCLUDED.currency,
               is_available = EXCLUDED.is_available, updated_at = NOW()",
        )
        .bind(&spec.spec_name)
        .bind(&spec.spec_type)
        .bind(&spec.gpu_type)
        .bind(spec.gpu_count)
        .bind(spec.cpu_cores)
        .bind(spec.ram_gb)
        .bind(spec.disk_gb)
        .bind(spec.price_per_hour)
        .bind(&spec.currency)
        .bind(spec.is_available)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
