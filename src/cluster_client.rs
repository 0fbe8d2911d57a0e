//! # Cluster Client: HTTP Façade for Execution Clusters
//!
//! Every execution cluster exposes the same JSON API, authenticated with a
//! per-cluster bearer token. [`ClusterClient`] wraps one cluster; the control
//! loops only depend on the narrower [`ClusterApi`] trait so tests can swap in
//! a scripted fake.
//!
//! ## Endpoints used
//!
//! | Operation | Method | Path |
//! |-----------|--------|------|
//! | create endpoint | POST | `/api/v1/endpoints` |
//! | endpoint detail / delete | GET / DELETE | `/api/v1/endpoints/{name}` |
//! | update deployment | PATCH | `/api/v1/endpoints/{name}/deployment` |
//! | autoscaler config | PUT | `/api/v1/autoscaler/endpoints/{name}` |
//! | list workers | GET | `/api/v1/endpoints/{name}/workers` |
//! | worker detail | GET | `/api/v1/workers/{id}` |
//! | worker logs | GET | `/api/v1/endpoints/{name}/logs` |
//! | tasks | GET/POST | `/v1/tasks`, `/v1/{name}/run`, `/v1/{name}/runsync`, `/v1/status/{id}`, `/v1/cancel/{id}` |
//! | metrics | GET | `/v1/{name}/metrics/realtime`, `/v1/{name}/metrics/stats` |
//! | statistics | GET | `/api/v1/statistics/endpoints/{name}`, `/api/v1/statistics/overview` |
//! | scaling history | GET | `/api/v1/autoscaler/endpoints/{name}/history` |
//!
//! ## Client cache
//!
//! [`ClientRegistry`] keeps one client per cluster id in a `DashMap`. Clients
//! are stateless wrappers around connection info, so two tasks racing to
//! build the same entry only duplicate work. An entry is rebuilt when the
//! cluster's endpoint or key changes.

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::db::{ClusterRow, EnvVars};
use crate::error::RemoteError;

/// Body of `POST /api/v1/endpoints`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEndpointRequest {
    pub endpoint: String,
    pub spec_name: String,
    pub image: String,
    pub replicas: i32,
    pub task_timeout: i32,
    pub min_replicas: i32,
    pub max_replicas: i32,
    #[serde(default, skip_serializing_if = "EnvVars::is_empty")]
    pub env: EnvVars,
}

/// Body of `PATCH /api/v1/endpoints/{name}/deployment`. Absent fields are
/// left unchanged by the cluster; `replicas: Some(0)` is sent as-is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<EnvVars>,
}

impl DeploymentUpdate {
    pub fn replicas(replicas: i32) -> Self {
        DeploymentUpdate {
            replicas: Some(replicas),
            ..Default::default()
        }
    }
}

/// Body of `PUT /api/v1/autoscaler/endpoints/{name}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoscalerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_timeout: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_up_threshold: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_down_idle_time: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Filters for `GET /v1/tasks`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskQuery {
    pub worker_id: Option<String>,
    pub status: Option<String>,
    pub task_id: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// The remote operations the control loops depend on.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn create_endpoint(&self, req: &CreateEndpointRequest) -> Result<(), RemoteError>;
    async fn get_endpoint(&self, name: &str) -> Result<Value, RemoteError>;
    async fn delete_endpoint(&self, name: &str) -> Result<(), RemoteError>;
    async fn update_deployment(&self, name: &str, update: &DeploymentUpdate)
        -> Result<(), RemoteError>;
    async fn update_autoscaler(&self, name: &str, config: &AutoscalerConfig)
        -> Result<(), RemoteError>;
    /// Live workers of an endpoint, as raw payloads for the tolerant decoder.
    async fn list_endpoint_workers(&self, name: &str) -> Result<Value, RemoteError>;
    /// Worker detail, including workers that are already offline.
    async fn get_worker(&self, worker_id: &str) -> Result<Value, RemoteError>;
}

#[derive(Clone)]
pub struct ClusterClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl ClusterClient {
    pub fn new(http: reqwest::Client, base_url: &str, api_key: &str) -> Self {
        ClusterClient {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    pub fn for_cluster(http: reqwest::Client, cluster: &ClusterRow) -> Self {
        Self::new(http, &cluster.api_endpoint, &cluster.api_key)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .http
            .request(method, format!("{}{}", self.base_url, path));
        if self.api_key.is_empty() {
            builder
        } else {
            builder.bearer_auth(&self.api_key)
        }
    }

    async fn send(builder: RequestBuilder) -> Result<reqwest::Response, RemoteError> {
        let resp = builder.send().await?;
        let status = resp.status();
        if status.is_client_error() || status.is_server_error() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RemoteError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp)
    }

    async fn send_json<T: DeserializeOwned>(builder: RequestBuilder) -> Result<T, RemoteError> {
        let resp = Self::send(builder).await?;
        resp.json::<T>()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))
    }

    // ── Passthroughs ────────────────────────────────────────────

    /// Raw log text for one pod of an endpoint.
    pub async fn worker_logs(
        &self,
        endpoint: &str,
        pod_name: &str,
        lines: u32,
    ) -> Result<String, RemoteError> {
        let builder = self
            .request(Method::GET, &format!("/api/v1/endpoints/{}/logs", seg(endpoint)))
            .query(&[("lines", lines.to_string()), ("pod_name", pod_name.to_string())]);
        let resp = Self::send(builder).await?;
        resp.text()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))
    }

    pub async fn list_tasks(&self, endpoint: &str, query: &TaskQuery) -> Result<Value, RemoteError> {
        let mut params: Vec<(&str, String)> = vec![
            ("endpoint", endpoint.to_string()),
            ("limit", query.limit.unwrap_or(20).to_string()),
            ("offset", query.offset.unwrap_or(0).to_string()),
        ];
        if let Some(w) = query.worker_id.as_deref().filter(|s| !s.is_empty()) {
            params.push(("worker_id", w.to_string()));
        }
        if let Some(s) = query.status.as_deref().filter(|s| !s.is_empty()) {
            params.push(("status", s.to_string()));
        }
        if let Some(t) = query.task_id.as_deref().filter(|s| !s.is_empty()) {
            params.push(("task_id", t.to_string()));
        }
        Self::send_json(self.request(Method::GET, "/v1/tasks").query(&params)).await
    }

    pub async fn submit_task(&self, endpoint: &str, input: &Value) -> Result<TaskResponse, RemoteError> {
        let builder = self
            .request(Method::POST, &format!("/v1/{}/run", seg(endpoint)))
            .json(&serde_json::json!({ "input": input }));
        Self::send_json(builder).await
    }

    pub async fn submit_task_sync(
        &self,
        endpoint: &str,
        input: &Value,
    ) -> Result<TaskResponse, RemoteError> {
        let builder = self
            .request(Method::POST, &format!("/v1/{}/runsync", seg(endpoint)))
            .json(&serde_json::json!({ "input": input }));
        Self::send_json(builder).await
    }

    pub async fn task_status(&self, task_id: &str) -> Result<TaskResponse, RemoteError> {
        Self::send_json(self.request(Method::GET, &format!("/v1/status/{}", seg(task_id)))).await
    }

    pub async fn cancel_task(&self, task_id: &str) -> Result<(), RemoteError> {
        Self::send(self.request(Method::POST, &format!("/v1/cancel/{}", seg(task_id)))).await?;
        Ok(())
    }

    pub async fn task_timeline(&self, task_id: &str) -> Result<Value, RemoteError> {
        Self::send_json(self.request(Method::GET, &format!("/v1/tasks/{}/timeline", seg(task_id))))
            .await
    }

    pub async fn task_execution_history(&self, task_id: &str) -> Result<Value, RemoteError> {
        let path = format!("/v1/tasks/{}/execution-history", seg(task_id));
        Self::send_json(self.request(Method::GET, &path)).await
    }

    pub async fn endpoint_metrics(&self, endpoint: &str) -> Result<Value, RemoteError> {
        let path = format!("/v1/{}/metrics/realtime", seg(endpoint));
        Self::send_json(self.request(Method::GET, &path)).await
    }

    pub async fn endpoint_statistics(&self, endpoint: &str) -> Result<Value, RemoteError> {
        let path = format!("/api/v1/statistics/endpoints/{}", seg(endpoint));
        Self::send_json(self.request(Method::GET, &path)).await
    }

    /// Aggregated stats over `[from, to]`; both bounds are passed through verbatim.
    pub async fn endpoint_stats(
        &self,
        endpoint: &str,
        from: Option<&str>,
        to: Option<&str>,
    ) -> Result<Value, RemoteError> {
        let mut params: Vec<(&str, &str)> = Vec::new();
        if let Some(from) = from.filter(|s| !s.is_empty()) {
            params.push(("from", from));
        }
        if let Some(to) = to.filter(|s| !s.is_empty()) {
            params.push(("to", to));
        }
        let path = format!("/v1/{}/metrics/stats", seg(endpoint));
        Self::send_json(self.request(Method::GET, &path).query(&params)).await
    }

    pub async fn tasks_overview(&self) -> Result<Value, RemoteError> {
        Self::send_json(self.request(Method::GET, "/api/v1/statistics/overview")).await
    }

    pub async fn scaling_history(&self, endpoint: &str, limit: u32) -> Result<Value, RemoteError> {
        let path = format!("/api/v1/autoscaler/endpoints/{}/history", seg(endpoint));
        Self::send_json(
            self.request(Method::GET, &path)
                .query(&[("limit", limit.to_string())]),
        )
        .await
    }
}

#[async_trait]
impl ClusterApi for ClusterClient {
    async fn create_endpoint(&self, req: &CreateEndpointRequest) -> Result<(), RemoteError> {
        Self::send(self.request(Method::POST, "/api/v1/endpoints").json(req)).await?;
        Ok(())
    }

    async fn get_endpoint(&self, name: &str) -> Result<Value, RemoteError> {
        Self::send_json(self.request(Method::GET, &format!("/api/v1/endpoints/{}", seg(name)))).await
    }

    async fn delete_endpoint(&self, name: &str) -> Result<(), RemoteError> {
        Self::send(self.request(Method::DELETE, &format!("/api/v1/endpoints/{}", seg(name))))
            .await?;
        Ok(())
    }

    async fn update_deployment(
        &self,
        name: &str,
        update: &DeploymentUpdate,
    ) -> Result<(), RemoteError> {
        let path = format!("/api/v1/endpoints/{}/deployment", seg(name));
        Self::send(self.request(Method::PATCH, &path).json(update)).await?;
        Ok(())
    }

    async fn update_autoscaler(
        &self,
        name: &str,
        config: &AutoscalerConfig,
    ) -> Result<(), RemoteError> {
        let path = format!("/api/v1/autoscaler/endpoints/{}", seg(name));
        Self::send(self.request(Method::PUT, &path).json(config)).await?;
        Ok(())
    }

    async fn list_endpoint_workers(&self, name: &str) -> Result<Value, RemoteError> {
        let path = format!("/api/v1/endpoints/{}/workers", seg(name));
        Self::send_json(self.request(Method::GET, &path)).await
    }

    async fn get_worker(&self, worker_id: &str) -> Result<Value, RemoteError> {
        Self::send_json(self.request(Method::GET, &format!("/api/v1/workers/{}", seg(worker_id))))
            .await
    }
}

/// Percent-encode one path segment.
fn seg(s: &str) -> std::borrow::Cow<'_, str> {
    urlencoding::encode(s)
}

// ── Client cache ────────────────────────────────────────────────

pub type ClientFactory = Arc<dyn Fn(&ClusterRow) -> Arc<dyn ClusterApi> + Send + Sync>;

struct CachedClient {
    api_endpoint: String,
    api_key: String,
    client: Arc<dyn ClusterApi>,
}

pub struct ClientRegistry {
    clients: DashMap<String, CachedClient>,
    factory: ClientFactory,
    http: reqwest::Client,
}

impl ClientRegistry {
    /// Registry producing [`ClusterClient`]s that share one connection pool.
    pub fn http(timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .build()?;
        let factory_http = http.clone();
        let factory: ClientFactory = Arc::new(move |cluster: &ClusterRow| {
            Arc::new(ClusterClient::for_cluster(factory_http.clone(), cluster)) as Arc<dyn ClusterApi>
        });
        Ok(ClientRegistry {
            clients: DashMap::new(),
            factory,
            http,
        })
    }

    /// Registry with a custom client constructor (tests, alternative transports).
    pub fn with_factory(factory: ClientFactory) -> Self {
        ClientRegistry {
            clients: DashMap::new(),
            factory,
            http: reqwest::Client::new(),
        }
    }

    pub fn client_for(&self, cluster: &ClusterRow) -> Arc<dyn ClusterApi> {
        if let Some(cached) = self.clients.get(&cluster.cluster_id) {
            if cached.api_endpoint == cluster.api_endpoint && cached.api_key == cluster.api_key {
                return cached.client.clone();
            }
        }
        let client = (self.factory)(cluster);
        self.clients.insert(
            cluster.cluster_id.clone(),
            CachedClient {
                api_endpoint: cluster.api_endpoint.clone(),
                api_key: cluster.api_key.clone(),
                client: client.clone(),
            },
        );
        client
    }

    /// Concrete HTTP client for the passthrough operations outside [`ClusterApi`].
    pub fn http_client_for(&self, cluster: &ClusterRow) -> ClusterClient {
        ClusterClient::for_cluster(self.http.clone(), cluster)
    }

    pub fn invalidate(&self, cluster_id: &str) {
        self.clients.remove(cluster_id);
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
