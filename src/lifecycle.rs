//! # Endpoint Lifecycle: Create, Update, Scale, Delete
//!
//! Orchestrates a tenant endpoint across the scheduler, the remote cluster
//! and the local `user_endpoints` table.
//!
//! ## Ordering
//!
//! | Operation | Remote | Local | On local failure |
//! |-----------|--------|-------|------------------|
//! | create | first | insert, then promote to `running` | compensating remote delete |
//! | delete | first | soft delete | remote already gone; retry the delete |
//! | scale / update | first | mirror accepted values | logged by caller |
//!
//! A dangling remote endpoint can be found and removed later; a local row
//! without a remote deployment would be reconciled and billed forever. The
//! only create failure that needs an operator is a compensating delete that
//! also fails ([`FleetError::CompensationFailed`]).
//!
//! The metering engine depends on [`EndpointScaler`] only, which
//! [`EndpointManager`] implements.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::cluster_client::{
    AutoscalerConfig, ClientRegistry, ClusterApi, ClusterClient, CreateEndpointRequest,
    DeploymentUpdate,
};
use crate::db::{ClusterRow, EndpointChanges, EndpointRow, EndpointStatus, EnvVars, NewEndpoint};
use crate::error::FleetError;
use crate::prom_metrics::Metrics;
use crate::scheduler;
use crate::store::FleetStore;

/// Scale capability used by balance enforcement.
#[async_trait]
pub trait EndpointScaler: Send + Sync {
    async fn scale_endpoint(&self, endpoint: &EndpointRow, replicas: i32) -> Result<(), FleetError>;
}

/// The authenticated caller. Requests are trusted to carry these from an
/// upstream authenticating proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tenant {
    pub user_id: String,
    pub org_id: String,
}

/// Tenant request to create an endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateEndpoint {
    pub logical_name: String,
    pub spec_name: String,
    pub image: String,
    #[serde(default)]
    pub replicas: i32,
    #[serde(default)]
    pub min_replicas: i32,
    #[serde(default)]
    pub max_replicas: i32,
    #[serde(default)]
    pub task_timeout: i32,
    #[serde(default)]
    pub env: EnvVars,
    #[serde(default)]
    pub prefer_region: Option<String>,
}

impl CreateEndpoint {
    pub fn validate(&self) -> Result<(), FleetError> {
        if self.logical_name.trim().is_empty() {
            return Err(FleetError::InvalidRequest("logical_name is required".into()));
        }
        if !self
            .logical_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(FleetError::InvalidRequest(format!(
                "logical_name {:?} may only contain letters, digits, '-' and '_'",
                self.logical_name
            )));
        }
        if self.spec_name.trim().is_empty() {
            return Err(FleetError::InvalidRequest("spec_name is required".into()));
        }
        if self.image.trim().is_empty() {
            return Err(FleetError::InvalidRequest("image is required".into()));
        }
        if self.replicas < 0 || self.min_replicas < 0 || self.max_replicas < 0 {
            return Err(FleetError::InvalidRequest(
                "replica counts must not be negative".into(),
            ));
        }
        if self.min_replicas > self.max_replicas {
            return Err(FleetError::InvalidRequest(format!(
                "min_replicas ({}) exceeds max_replicas ({})",
                self.min_replicas, self.max_replicas
            )));
        }
        if self.task_timeout < 0 {
            return Err(FleetError::InvalidRequest(
                "task_timeout must not be negative".into(),
            ));
        }
        Ok(())
    }

    /// Deployment name on the cluster.
    pub fn physical_name(&self) -> String {
        self.logical_name.to_lowercase()
    }

    /// Replica count sent to the cluster; `0` falls back to `min_replicas`.
    pub fn initial_replicas(&self) -> i32 {
        if self.replicas == 0 {
            self.min_replicas
        } else {
            self.replicas
        }
    }
}

pub struct EndpointManager {
    store: Arc<dyn FleetStore>,
    clients: Arc<ClientRegistry>,
    metrics: Arc<Metrics>,
}

impl EndpointManager {
    pub fn new(store: Arc<dyn FleetStore>, clients: Arc<ClientRegistry>, metrics: Arc<Metrics>) -> Self {
        EndpointManager {
            store,
            clients,
            metrics,
        }
    }

    pub fn clients(&self) -> &Arc<ClientRegistry> {
        &self.clients
    }

    pub async fn create(&self, tenant: &Tenant, req: &CreateEndpoint) -> Result<EndpointRow, FleetError> {
        req.validate()?;
        let physical_name = req.physical_name();
        let live = self.store.list_user_endpoints(&tenant.user_id).await?;
        if let Some(existing) = live
            .iter()
            .find(|e| e.logical_name == req.logical_name || e.physical_name == physical_name)
        {
            return Err(FleetError::Conflict(format!(
                "endpoint {} already exists (deployed as {})",
                existing.logical_name, existing.physical_name
            )));
        }

        let region = req.prefer_region.as_deref().unwrap_or("");
        let selection = scheduler::select_cluster(self.store.as_ref(), &req.spec_name, region).await?;
        let cluster = &selection.candidate.cluster;
        let pricing = &selection.pricing;
        let replicas = req.initial_replicas();

        let client = self.clients.client_for(cluster);
        client
            .create_endpoint(&CreateEndpointRequest {
                endpoint: physical_name.clone(),
                spec_name: selection.candidate.cluster_spec.cluster_spec_name.clone(),
                image: req.image.clone(),
                replicas,
                task_timeout: req.task_timeout,
                min_replicas: req.min_replicas,
                max_replicas: req.max_replicas,
                env: req.env.clone(),
            })
            .await
            .map_err(|e| {
                warn!(
                    cluster_id = %cluster.cluster_id,
                    endpoint = %physical_name,
                    error = %e,
                    "remote endpoint create failed"
                );
                self.metrics.remote_error(&cluster.cluster_id);
                FleetError::remote(&cluster.cluster_id, e)
            })?;

        let new_endpoint = NewEndpoint {
            user_id: tenant.user_id.clone(),
            org_id: tenant.org_id.clone(),
            logical_name: req.logical_name.clone(),
            physical_name: physical_name.clone(),
            spec_name: req.spec_name.clone(),
            spec_type: pricing.spec_type.clone(),
            gpu_type: pricing.gpu_type.clone(),
            gpu_count: pricing.gpu_count,
            cpu_cores: pricing.cpu_cores,
            ram_gb: pricing.ram_gb,
            cluster_id: cluster.cluster_id.clone(),
            replicas,
            min_replicas: req.min_replicas,
            max_replicas: req.max_replicas,
            image: req.image.clone(),
            task_timeout: req.task_timeout,
            env: req.env.clone(),
            price_per_hour: pricing.price_per_hour,
            currency: pricing.currency.clone(),
            prefer_region: req.prefer_region.clone().filter(|r| !r.is_empty()),
        };

        let mut row = match self.store.insert_endpoint(&new_endpoint).await {
            Ok(row) => row,
            Err(cause) => {
                return Err(self
                    .compensate_create(client.as_ref(), &cluster.cluster_id, &physical_name, cause)
                    .await)
            }
        };

        match self
            .store
            .set_endpoint_status(row.id, EndpointStatus::Running)
            .await
        {
            Ok(()) => row.status = EndpointStatus::Running,
            Err(e) => warn!(
                endpoint_id = row.id,
                error = %e,
                "endpoint created but promotion to running failed"
            ),
        }

        info!(
            endpoint_id = row.id,
            user_id = %tenant.user_id,
            logical_name = %row.logical_name,
            cluster_id = %row.cluster_id,
            score = selection.candidate.score,
            price_per_hour = row.price_per_hour,
            "endpoint created"
        );
        Ok(row)
    }

    async fn compensate_create(
        &self,
        client: &dyn ClusterApi,
        cluster_id: &str,
        physical_name: &str,
        cause: anyhow::Error,
    ) -> FleetError {
        warn!(
            cluster_id,
            endpoint = physical_name,
            error = %cause,
            "local insert failed after remote create, deleting remote endpoint"
        );
        match client.delete_endpoint(physical_name).await {
            Ok(()) => FleetError::Persistence(cause),
            Err(compensation) => {
                self.metrics.compensation_failures.inc();
                error!(
                    alert = true,
                    cluster_id,
                    endpoint = physical_name,
                    error = %cause,
                    compensation_error = %compensation,
                    "compensating delete failed, remote endpoint left dangling"
                );
                FleetError::CompensationFailed {
                    cluster_id: cluster_id.to_string(),
                    physical_name: physical_name.to_string(),
                    source: cause,
                    compensation,
                }
            }
        }
    }

    /// Live endpoint by tenant and logical name.
    pub async fn get(&self, tenant: &Tenant, logical_name: &str) -> Result<EndpointRow, FleetError> {
        self.store
            .find_endpoint(&tenant.user_id, logical_name)
            .await?
            .ok_or_else(|| FleetError::not_found("endpoint", logical_name))
    }

    pub async fn list(&self, tenant: &Tenant) -> Result<Vec<EndpointRow>, FleetError> {
        Ok(self.store.list_user_endpoints(&tenant.user_id).await?)
    }

    pub async fn cluster_for(&self, endpoint: &EndpointRow) -> Result<ClusterRow, FleetError> {
        self.store
            .get_cluster(&endpoint.cluster_id)
            .await?
            .ok_or_else(|| FleetError::not_found("cluster", &endpoint.cluster_id))
    }

    /// HTTP client for the endpoint's cluster, for passthrough calls outside
    /// [`ClusterApi`]. Errors from those calls go through [`Self::remote_error`].
    pub async fn passthrough_client(&self, endpoint: &EndpointRow) -> Result<ClusterClient, FleetError> {
        let cluster = self.cluster_for(endpoint).await?;
        Ok(self.clients.http_client_for(&cluster))
    }

    pub fn remote_error(&self, endpoint: &EndpointRow, e: crate::error::RemoteError) -> FleetError {
        self.metrics.remote_error(&endpoint.cluster_id);
        FleetError::remote(&endpoint.cluster_id, e)
    }

    /// Remote deployment detail, passed through as returned by the cluster.
    pub async fn remote_detail(&self, endpoint: &EndpointRow) -> Result<Value, FleetError> {
        let cluster = self.cluster_for(endpoint).await?;
        self.clients
            .client_for(&cluster)
            .get_endpoint(&endpoint.physical_name)
            .await
            .map_err(|e| self.remote_failure(&cluster, e))
    }

    /// Remove the deployment from its cluster, then tombstone the row. A
    /// cluster that no longer knows the endpoint counts as removed.
    pub async fn delete(&self, tenant: &Tenant, logical_name: &str) -> Result<(), FleetError> {
        let endpoint = self.get(tenant, logical_name).await?;
        let cluster = self.cluster_for(&endpoint).await?;
        match self
            .clients
            .client_for(&cluster)
            .delete_endpoint(&endpoint.physical_name)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                info!(
                    endpoint_id = endpoint.id,
                    cluster_id = %cluster.cluster_id,
                    "remote endpoint already absent"
                );
            }
            Err(e) => return Err(self.remote_failure(&cluster, e)),
        }
        self.store.soft_delete_endpoint(endpoint.id).await?;
        info!(
            endpoint_id = endpoint.id,
            logical_name = %endpoint.logical_name,
            "endpoint deleted"
        );
        Ok(())
    }

    /// Set the replica target on the cluster, then locally. `0` stops the
    /// endpoint.
    pub async fn scale(&self, endpoint: &EndpointRow, replicas: i32) -> Result<(), FleetError> {
        if replicas < 0 {
            return Err(FleetError::InvalidRequest(
                "replicas must not be negative".into(),
            ));
        }
        let cluster = self.cluster_for(endpoint).await?;
        self.clients
            .client_for(&cluster)
            .update_deployment(&endpoint.physical_name, &DeploymentUpdate::replicas(replicas))
            .await
            .map_err(|e| self.remote_failure(&cluster, e))?;
        self.store
            .apply_endpoint_changes(
                endpoint.id,
                &EndpointChanges {
                    replicas: Some(replicas),
                    ..Default::default()
                },
            )
            .await?;
        info!(
            endpoint_id = endpoint.id,
            from = endpoint.replicas,
            to = replicas,
            "endpoint scaled"
        );
        Ok(())
    }

    pub async fn scale_by_name(
        &self,
        tenant: &Tenant,
        logical_name: &str,
        replicas: i32,
    ) -> Result<EndpointRow, FleetError> {
        let endpoint = self.get(tenant, logical_name).await?;
        self.scale(&endpoint, replicas).await?;
        self.reload(endpoint.id).await
    }

    pub async fn update_deployment(
        &self,
        tenant: &Tenant,
        logical_name: &str,
        update: &DeploymentUpdate,
    ) -> Result<EndpointRow, FleetError> {
        if update.replicas.is_none() && update.image.is_none() && update.env.is_none() {
            return Err(FleetError::InvalidRequest(
                "deployment update must set replicas, image or env".into(),
            ));
        }
        if update.replicas.is_some_and(|r| r < 0) {
            return Err(FleetError::InvalidRequest(
                "replicas must not be negative".into(),
            ));
        }
        let endpoint = self.get(tenant, logical_name).await?;
        let cluster = self.cluster_for(&endpoint).await?;
        self.clients
            .client_for(&cluster)
            .update_deployment(&endpoint.physical_name, update)
            .await
            .map_err(|e| self.remote_failure(&cluster, e))?;
        let changes = EndpointChanges {
            replicas: update.replicas,
            image: update.image.clone().filter(|i| !i.is_empty()),
            env: update.env.clone(),
            ..Default::default()
        };
        self.store.apply_endpoint_changes(endpoint.id, &changes).await?;
        self.reload(endpoint.id).await
    }

    pub async fn update_autoscaler(
        &self,
        tenant: &Tenant,
        logical_name: &str,
        config: &AutoscalerConfig,
    ) -> Result<EndpointRow, FleetError> {
        let endpoint = self.get(tenant, logical_name).await?;
        let min = config.min_replicas.unwrap_or(endpoint.min_replicas);
        let max = config.max_replicas.unwrap_or(endpoint.max_replicas);
        if min < 0 || max < 0 || min > max {
            return Err(FleetError::InvalidRequest(format!(
                "invalid replica bounds: min {min}, max {max}"
            )));
        }
        let cluster = self.cluster_for(&endpoint).await?;
        self.clients
            .client_for(&cluster)
            .update_autoscaler(&endpoint.physical_name, config)
            .await
            .map_err(|e| self.remote_failure(&cluster, e))?;
        let changes = EndpointChanges {
            min_replicas: config.min_replicas,
            max_replicas: config.max_replicas,
            task_timeout: config.task_timeout,
            ..Default::default()
        };
        self.store.apply_endpoint_changes(endpoint.id, &changes).await?;
        self.reload(endpoint.id).await
    }

    async fn reload(&self, id: i64) -> Result<EndpointRow, FleetError> {
        self.store
            .get_endpoint(id)
            .await?
            .ok_or_else(|| FleetError::not_found("endpoint", id.to_string()))
    }

    fn remote_failure(&self, cluster: &ClusterRow, e: crate::error::RemoteError) -> FleetError {
        self.metrics.remote_error(&cluster.cluster_id);
        FleetError::remote(&cluster.cluster_id, e)
    }
}

#[async_trait]
impl EndpointScaler for EndpointManager {
    async fn scale_endpoint(&self, endpoint: &EndpointRow, replicas: i32) -> Result<(), FleetError> {
        self.scale(endpoint, replicas).await
    }
}
