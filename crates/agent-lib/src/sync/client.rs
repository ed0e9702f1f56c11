//! HTTP client for the fleet control plane
//!
//! Every request carries the `X-API-KEY` header and every response is a
//! `{code, message, data}` envelope. Simple calls are sent once. Bulk
//! delta and event uploads retry transient failures with a fixed delay and
//! a bounded number of attempts.

use super::types::{
    Envelope, RebalanceConfiguration, RebalanceNodeClass, RebalanceNodeClassList,
    RebalanceNodePool, RebalanceNodePoolList, RebalanceState, RebalanceStatus,
    RegisterClusterRequest, RegisterClusterResponse, WorkloadRebalanceConfiguration,
};
use crate::error::TransportError;
use crate::models::CloudProvider;
use crate::observability::AgentMetrics;
use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use url::Url;

pub const API_KEY_HEADER: &str = "X-API-KEY";

/// Configuration for the control plane client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL, e.g. "https://control-plane:8443"
    pub endpoint: String,
    pub api_key: String,
    /// Empty until the cluster registers
    pub cluster_id: String,
    pub request_timeout: Duration,
    /// Attempts per bulk upload, including the first
    pub retry_max_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://control-plane:8443".to_string(),
            api_key: String::new(),
            cluster_id: String::new(),
            request_timeout: Duration::from_secs(30),
            retry_max_attempts: 5,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Client for the control plane REST API
pub struct ControlPlaneClient {
    config: ClientConfig,
    http: reqwest::Client,
    cluster_id: Arc<RwLock<String>>,
    metrics: AgentMetrics,
}

impl ControlPlaneClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        Url::parse(&config.endpoint)
            .with_context(|| format!("Invalid control plane endpoint: {}", config.endpoint))?;

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            cluster_id: Arc::new(RwLock::new(config.cluster_id.clone())),
            config,
            http,
            metrics: AgentMetrics::new(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    pub async fn cluster_id(&self) -> String {
        self.cluster_id.read().await.clone()
    }

    fn url(&self, path: &str) -> Result<Url, TransportError> {
        let base = self.config.endpoint.trim_end_matches('/');
        Ok(Url::parse(&format!("{base}{path}"))?)
    }

    async fn cluster_url(&self, suffix: &str) -> Result<Url, TransportError> {
        let id = self.cluster_id.read().await;
        self.url(&format!("/api/v1/clusters/{}/{}", id, suffix.trim_start_matches('/')))
    }

    async fn rebalance_url(&self, suffix: &str) -> Result<Url, TransportError> {
        let id = self.cluster_id.read().await;
        self.url(&format!("/api/v1/rebalance/clusters/{id}/{suffix}"))
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.http
            .request(method, url)
            .header(API_KEY_HEADER, &self.config.api_key)
    }

    /// Register the cluster and remember the id the control plane assigns
    ///
    /// A response without an id is an error and leaves the current id in place.
    pub async fn register_cluster(
        &self,
        request: &RegisterClusterRequest,
    ) -> Result<String, TransportError> {
        let url = self.url("/api/v1/clusters/registration")?;
        let envelope = self.send_json(Method::POST, url, Some(request)).await?;
        let response: RegisterClusterResponse = decode_data(envelope)?;
        if response.cluster_id.trim().is_empty() {
            return Err(TransportError::EmptyClusterId);
        }

        *self.cluster_id.write().await = response.cluster_id.clone();
        info!(cluster_id = %response.cluster_id, "Cluster registered");
        Ok(response.cluster_id)
    }

    pub async fn send_heartbeat(&self) -> Result<(), TransportError> {
        let url = self.cluster_url("heartbeat").await?;
        self.send_json::<()>(Method::GET, url, None).await?;
        debug!("Heartbeat sent");
        Ok(())
    }

    pub async fn get_rebalance_configuration(
        &self,
    ) -> Result<RebalanceConfiguration, TransportError> {
        let url = self.rebalance_url("configuration").await?;
        decode_data(self.send_json::<()>(Method::GET, url, None).await?)
    }

    pub async fn update_rebalance_configuration(
        &self,
        configuration: &RebalanceConfiguration,
    ) -> Result<(), TransportError> {
        let url = self.rebalance_url("configuration").await?;
        self.send_json(Method::POST, url, Some(configuration)).await?;
        Ok(())
    }

    pub async fn get_rebalance_status(&self) -> Result<RebalanceStatus, TransportError> {
        let url = self.rebalance_url("status").await?;
        decode_data(self.send_json::<()>(Method::GET, url, None).await?)
    }

    /// Report the rebalance state, stamped with the current time
    pub async fn update_rebalance_status(
        &self,
        state: RebalanceState,
        message: impl Into<String>,
    ) -> Result<(), TransportError> {
        let status = RebalanceStatus {
            state,
            last_components_active_time: Some(chrono::Utc::now()),
            message: message.into(),
        };
        let url = self.rebalance_url("status").await?;
        self.send_json(Method::POST, url, Some(&status)).await?;
        Ok(())
    }

    pub async fn list_rebalance_node_pools(&self) -> Result<RebalanceNodePoolList, TransportError> {
        let url = self.rebalance_url("nodepools").await?;
        decode_data(self.send_json::<()>(Method::GET, url, None).await?)
    }

    /// Upload one node pool; `pool` must carry the shape for `provider`
    pub async fn update_rebalance_node_pool(
        &self,
        provider: CloudProvider,
        pool: &RebalanceNodePool,
    ) -> Result<(), TransportError> {
        if !pool.matches(provider) {
            return Err(TransportError::ProviderMismatch {
                resource: "node pool",
                provider,
            });
        }
        let url = self.rebalance_url("nodepools").await?;
        self.send_json(Method::POST, url, Some(pool)).await?;
        Ok(())
    }

    pub async fn list_rebalance_node_classes(
        &self,
    ) -> Result<RebalanceNodeClassList, TransportError> {
        let url = self.rebalance_url("nodeclasses").await?;
        decode_data(self.send_json::<()>(Method::GET, url, None).await?)
    }

    /// Upload one node class; `class` must carry the shape for `provider`
    pub async fn update_rebalance_node_class(
        &self,
        provider: CloudProvider,
        class: &RebalanceNodeClass,
    ) -> Result<(), TransportError> {
        if !class.matches(provider) {
            return Err(TransportError::ProviderMismatch {
                resource: "node class",
                provider,
            });
        }
        let url = self.rebalance_url("nodeclasses").await?;
        self.send_json(Method::POST, url, Some(class)).await?;
        Ok(())
    }

    pub async fn get_workload_rebalance_configuration(
        &self,
    ) -> Result<WorkloadRebalanceConfiguration, TransportError> {
        let url = self.rebalance_url("workloads/configuration").await?;
        decode_data(self.send_json::<()>(Method::GET, url, None).await?)
    }

    /// Upload an encoded cluster snapshot
    pub async fn send_cluster_deltas(&self, data: &[u8]) -> Result<(), TransportError> {
        let url = self.cluster_url("deltas").await?;
        self.send_with_retry(url, data, false).await?;
        Ok(())
    }

    pub async fn send_optimization_expectation(&self, data: &[u8]) -> Result<(), TransportError> {
        let url = self.cluster_url("optimization").await?;
        self.send_with_retry(url, data, false).await?;
        Ok(())
    }

    /// Upload a gzip-compressed event payload
    ///
    /// `path` is relative to the cluster, e.g. `events/pods`.
    pub async fn send_event_data(&self, data: &[u8], path: &str) -> Result<(), TransportError> {
        if data.is_empty() {
            return Err(TransportError::EmptyPayload);
        }
        let url = self.cluster_url(path).await?;
        self.send_with_retry(url, data, true).await?;
        Ok(())
    }

    async fn send_json<B: Serialize + ?Sized>(
        &self,
        method: Method,
        url: Url,
        body: Option<&B>,
    ) -> Result<Envelope, TransportError> {
        let mut request = self.request(method, url);
        if let Some(body) = body {
            let bytes = serde_json::to_vec(body).map_err(TransportError::Encode)?;
            request = request.header(CONTENT_TYPE, "application/json").body(bytes);
        }
        read_envelope(request.send().await?).await
    }

    async fn send_once(
        &self,
        url: &Url,
        body: Vec<u8>,
        gzip: bool,
    ) -> Result<Envelope, TransportError> {
        let mut request = self
            .request(Method::POST, url.clone())
            .header(CONTENT_TYPE, "application/json");
        if gzip {
            request = request.header(CONTENT_ENCODING, "gzip");
        }
        read_envelope(request.body(body).send().await?).await
    }

    async fn send_with_retry(
        &self,
        url: Url,
        data: &[u8],
        gzip: bool,
    ) -> Result<Envelope, TransportError> {
        let body = if gzip { compress(data)? } else { data.to_vec() };
        let max_attempts = self.config.retry_max_attempts.max(1);

        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.send_once(&url, body.clone(), gzip).await {
                Ok(envelope) => {
                    debug!(url = %url, bytes = body.len(), attempts, "Upload accepted");
                    return Ok(envelope);
                }
                Err(e) if !e.is_transient() => {
                    error!(url = %url, error = %e, "Upload rejected");
                    self.metrics.inc_transport_failures();
                    return Err(e);
                }
                Err(e) => {
                    if attempts >= max_attempts {
                        error!(
                            url = %url,
                            error = %e,
                            attempts = attempts,
                            "Upload failed after max attempts"
                        );
                        self.metrics.inc_transport_failures();
                        return Err(TransportError::RetriesExhausted {
                            attempts,
                            last: Box::new(e),
                        });
                    }

                    warn!(url = %url, error = %e, attempt = attempts, "Upload failed, retrying");
                    self.metrics.inc_transport_retries();
                    tokio::time::sleep(self.config.retry_delay).await;
                }
            }
        }
    }
}

/// Read a response body, inflating it when gzip-encoded
async fn read_body(response: Response) -> Result<Vec<u8>, TransportError> {
    let gzipped = response
        .headers()
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map_or(false, |v| v.eq_ignore_ascii_case("gzip"));
    let bytes = response.bytes().await?;

    if !gzipped {
        return Ok(bytes.to_vec());
    }
    let mut inflated = Vec::new();
    GzDecoder::new(&bytes[..]).read_to_end(&mut inflated)?;
    Ok(inflated)
}

/// Turn a response into its envelope, failing on any non-success signal
///
/// An empty 200 body counts as success.
async fn read_envelope(response: Response) -> Result<Envelope, TransportError> {
    let status = response.status();
    let body = read_body(response).await?;

    if status != StatusCode::OK {
        let message = serde_json::from_slice::<Envelope>(&body)
            .map(|e| e.message)
            .ok()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| String::from_utf8_lossy(&body).into_owned());
        return Err(TransportError::Status {
            status: status.as_u16(),
            message,
        });
    }

    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Envelope::default());
    }
    let envelope: Envelope = serde_json::from_slice(&body).map_err(TransportError::Envelope)?;
    if !envelope.is_success() {
        return Err(TransportError::Rejected {
            code: envelope.code,
            message: envelope.message,
        });
    }
    Ok(envelope)
}

fn decode_data<T: DeserializeOwned>(envelope: Envelope) -> Result<T, TransportError> {
    serde_json::from_value(envelope.data).map_err(TransportError::Envelope)
}

pub(crate) fn compress(data: &[u8]) -> Result<Vec<u8>, TransportError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Builder for ControlPlaneClient configuration
pub struct ControlPlaneClientBuilder {
    config: ClientConfig,
    api_key: Option<String>,
}

impl ControlPlaneClientBuilder {
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
            api_key: None,
        }
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.endpoint = endpoint.into();
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn cluster_id(mut self, id: impl Into<String>) -> Self {
        self.config.cluster_id = id.into();
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn retry_max_attempts(mut self, attempts: u32) -> Self {
        self.config.retry_max_attempts = attempts;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry_delay = delay;
        self
    }

    pub fn build(mut self) -> Result<ControlPlaneClient> {
        let api_key = self
            .api_key
            .filter(|k| !k.is_empty())
            .ok_or_else(|| anyhow::anyhow!("api_key is required"))?;
        self.config.api_key = api_key;

        ControlPlaneClient::new(self.config)
    }
}

impl Default for ControlPlaneClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::types::{EcsNodeClass, EcsNodePool};
    use mockito::Matcher;

    fn client(server: &mockito::Server) -> ControlPlaneClient {
        ControlPlaneClientBuilder::new()
            .endpoint(server.url())
            .api_key("secret")
            .cluster_id("c-1")
            .retry_max_attempts(3)
            .retry_delay(Duration::from_millis(10))
            .build()
            .unwrap()
    }

    #[test]
    fn test_client_config_default() {
        let config = ClientConfig::default();
        assert_eq!(config.retry_max_attempts, 5);
        assert_eq!(config.retry_delay, Duration::from_secs(1));
    }

    #[test]
    fn test_builder_missing_api_key() {
        let result = ControlPlaneClientBuilder::new()
            .endpoint("https://test:8443")
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_invalid_endpoint() {
        let result = ControlPlaneClientBuilder::new()
            .endpoint("not a url")
            .api_key("secret")
            .build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_register_stores_cluster_id() {
        let mut server = mockito::Server::new_async().await;
        let register = server
            .mock("POST", "/api/v1/clusters/registration")
            .match_header("x-api-key", "secret")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "agentVersion": "v0.1.0",
                "cloudProvider": "aws",
            })))
            .with_status(200)
            .with_body(r#"{"code":200,"message":"ok","data":{"clusterId":"c-42"}}"#)
            .create_async()
            .await;
        let heartbeat = server
            .mock("GET", "/api/v1/clusters/c-42/heartbeat")
            .match_header("x-api-key", "secret")
            .with_status(200)
            .create_async()
            .await;

        let client = client(&server);
        let request = RegisterClusterRequest {
            agent_version: "v0.1.0".to_string(),
            cloud_provider: CloudProvider::Aws,
            ..Default::default()
        };

        let id = client.register_cluster(&request).await.unwrap();
        assert_eq!(id, "c-42");
        assert_eq!(client.cluster_id().await, "c-42");

        client.send_heartbeat().await.unwrap();
        register.assert_async().await;
        heartbeat.assert_async().await;
    }

    #[tokio::test]
    async fn test_non_200_carries_server_message() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v1/rebalance/clusters/c-1/configuration")
            .with_status(403)
            .with_body(r#"{"code":403,"message":"invalid api key"}"#)
            .create_async()
            .await;

        let err = client(&server).get_rebalance_configuration().await.unwrap_err();
        match err {
            TransportError::Status { status, message } => {
                assert_eq!(status, 403);
                assert_eq!(message, "invalid api key");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_rebalance_configuration_roundtrip() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v1/rebalance/clusters/c-1/configuration")
            .with_status(200)
            .with_body(r#"{"code":0,"data":{"uploadConfig":true,"enable":true}}"#)
            .create_async()
            .await;
        let update = server
            .mock("POST", "/api/v1/rebalance/clusters/c-1/configuration")
            .match_body(Matcher::Json(serde_json::json!({
                "uploadConfig": false,
                "enable": true,
                "enableDiversityInstanceType": false,
            })))
            .with_status(200)
            .with_body(r#"{"code":0}"#)
            .create_async()
            .await;

        let client = client(&server);
        let mut cfg = client.get_rebalance_configuration().await.unwrap();
        assert!(cfg.upload_config);
        assert!(cfg.enable);

        cfg.upload_config = false;
        client.update_rebalance_configuration(&cfg).await.unwrap();
        update.assert_async().await;
    }

    #[tokio::test]
    async fn test_register_without_cluster_id_fails() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/v1/clusters/registration")
            .with_status(200)
            .with_body(r#"{"code":200,"message":"ok","data":{}}"#)
            .create_async()
            .await;
        let heartbeat = server
            .mock("GET", "/api/v1/clusters/c-1/heartbeat")
            .with_status(200)
            .create_async()
            .await;

        let client = client(&server);
        let err = client
            .register_cluster(&RegisterClusterRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::EmptyClusterId));

        // The configured id is kept, so later calls still address the cluster
        assert_eq!(client.cluster_id().await, "c-1");
        client.send_heartbeat().await.unwrap();
        heartbeat.assert_async().await;
    }

    #[tokio::test]
    async fn test_rebalance_node_pools_roundtrip() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v1/rebalance/clusters/c-1/nodepools")
            .match_header("x-api-key", "secret")
            .with_status(200)
            .with_body(
                r#"{"code":0,"data":{"ec2NodePools":null,"ecsNodePools":[
                    {"name":"general","enable":true,"nodePoolSpec":{"weight":10}}]}}"#,
            )
            .create_async()
            .await;
        let update = server
            .mock("POST", "/api/v1/rebalance/clusters/c-1/nodepools")
            .match_header("x-api-key", "secret")
            .match_body(Matcher::Json(serde_json::json!({
                "ec2NodePool": null,
                "ecsNodePool": {
                    "name": "general",
                    "enable": false,
                    "nodePoolSpec": {"weight": 10},
                },
            })))
            .with_status(200)
            .with_body(r#"{"code":0}"#)
            .create_async()
            .await;

        let client = client(&server);
        let list = client.list_rebalance_node_pools().await.unwrap();
        assert!(list.ec2_node_pools.is_empty());
        assert_eq!(list.ecs_node_pools.len(), 1);

        let mut pool = list.ecs_node_pools[0].clone();
        pool.enable = false;
        client
            .update_rebalance_node_pool(CloudProvider::AlibabaCloud, &RebalanceNodePool::ecs(pool))
            .await
            .unwrap();
        update.assert_async().await;
    }

    #[tokio::test]
    async fn test_node_pool_provider_mismatch_not_sent() {
        let mut server = mockito::Server::new_async().await;
        let update = server
            .mock("POST", "/api/v1/rebalance/clusters/c-1/nodepools")
            .expect(0)
            .create_async()
            .await;

        let pool = RebalanceNodePool::ecs(EcsNodePool {
            name: "general".to_string(),
            ..Default::default()
        });
        let err = client(&server)
            .update_rebalance_node_pool(CloudProvider::Aws, &pool)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::ProviderMismatch {
                provider: CloudProvider::Aws,
                ..
            }
        ));
        update.assert_async().await;
    }

    #[tokio::test]
    async fn test_rebalance_node_classes_roundtrip() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v1/rebalance/clusters/c-1/nodeclasses")
            .with_status(200)
            .with_body(
                r#"{"code":200,"data":{"ec2NodeClasses":[
                    {"name":"default","nodeClassSpec":{"amiFamily":"AL2023"}}]}}"#,
            )
            .create_async()
            .await;
        let update = server
            .mock("POST", "/api/v1/rebalance/clusters/c-1/nodeclasses")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "ec2NodeClass": {
                    "name": "default",
                    "nodeClassSpec": {"amiFamily": "AL2023"},
                },
            })))
            .with_status(200)
            .with_body(r#"{"code":200}"#)
            .create_async()
            .await;

        let client = client(&server);
        let list = client.list_rebalance_node_classes().await.unwrap();
        assert!(list.ecs_node_classes.is_empty());
        assert_eq!(list.ec2_node_classes[0].node_class_spec["amiFamily"], "AL2023");

        let class = RebalanceNodeClass::ec2(list.ec2_node_classes[0].clone());
        client
            .update_rebalance_node_class(CloudProvider::Aws, &class)
            .await
            .unwrap();
        update.assert_async().await;
    }

    #[tokio::test]
    async fn test_node_class_update_rejected() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/v1/rebalance/clusters/c-1/nodeclasses")
            .with_status(500)
            .with_body(r#"{"code":500,"message":"nodeclass conflict"}"#)
            .expect(1)
            .create_async()
            .await;

        let class = RebalanceNodeClass::ecs(EcsNodeClass {
            name: "default".to_string(),
            node_class_spec: serde_json::json!({}),
        });
        let err = client(&server)
            .update_rebalance_node_class(CloudProvider::AlibabaCloud, &class)
            .await
            .unwrap_err();
        match err {
            TransportError::Status { status, message } => {
                assert_eq!(status, 500);
                assert_eq!(message, "nodeclass conflict");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_workload_rebalance_configuration() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v1/rebalance/clusters/c-1/workloads/configuration")
            .with_status(200)
            .with_body(
                r#"{"code":0,"data":{"workloads":[{"name":"db","type":"StatefulSet",
                    "namespace":"data","replicas":2,"rebalanceAble":false}]}}"#,
            )
            .create_async()
            .await;

        let cfg = client(&server)
            .get_workload_rebalance_configuration()
            .await
            .unwrap();
        assert_eq!(cfg.workloads.len(), 1);
        assert!(!cfg.by_key()["statefulset/data/db"].rebalance_able);
    }

    #[tokio::test]
    async fn test_update_rebalance_status() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v1/rebalance/clusters/c-1/status")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "state": "Draining",
                "message": "2 nodes left",
            })))
            .with_status(200)
            .with_body(r#"{"code":200}"#)
            .create_async()
            .await;

        client(&server)
            .update_rebalance_status(RebalanceState::Draining, "2 nodes left")
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_deltas_retry_on_5xx() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v1/clusters/c-1/deltas")
            .match_header("x-api-key", "secret")
            .with_status(503)
            .with_body(r#"{"code":503,"message":"busy"}"#)
            .expect(3)
            .create_async()
            .await;

        let err = client(&server).send_cluster_deltas(b"{}").await.unwrap_err();
        assert!(matches!(err, TransportError::RetriesExhausted { attempts: 3, .. }));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_envelope_rejection_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v1/clusters/c-1/deltas")
            .with_status(200)
            .with_body(r#"{"code":4001,"message":"unknown cluster"}"#)
            .expect(1)
            .create_async()
            .await;

        let err = client(&server).send_cluster_deltas(b"{}").await.unwrap_err();
        assert!(matches!(err, TransportError::Rejected { code: 4001, .. }));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_client_error_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v1/clusters/c-1/optimization")
            .with_status(400)
            .with_body("bad request")
            .expect(1)
            .create_async()
            .await;

        let err = client(&server)
            .send_optimization_expectation(b"{}")
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Status { status: 400, .. }));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_deltas_sent_uncompressed() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v1/clusters/c-1/deltas")
            .match_header("content-encoding", Matcher::Missing)
            .match_body(r#"{"nodeDeltas":{}}"#)
            .with_status(200)
            .with_body(r#"{"code":0}"#)
            .create_async()
            .await;

        client(&server)
            .send_cluster_deltas(br#"{"nodeDeltas":{}}"#)
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_event_data_is_gzipped() {
        let mut server = mockito::Server::new_async().await;
        let response = compress(br#"{"code":0,"message":"stored"}"#).unwrap();
        let mock = server
            .mock("POST", "/api/v1/clusters/c-1/events/pods")
            .match_header("content-encoding", "gzip")
            .match_header("x-api-key", "secret")
            .with_status(200)
            .with_header("content-encoding", "gzip")
            .with_body(response)
            .create_async()
            .await;

        client(&server)
            .send_event_data(br#"[{"pod":"web-1"}]"#, "events/pods")
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_gzipped_rejection_is_inflated() {
        let mut server = mockito::Server::new_async().await;
        let response = compress(br#"{"code":5003,"message":"quota exceeded"}"#).unwrap();
        server
            .mock("POST", "/api/v1/clusters/c-1/events/pods")
            .with_status(200)
            .with_header("content-encoding", "gzip")
            .with_body(response)
            .create_async()
            .await;

        let err = client(&server)
            .send_event_data(b"[]", "events/pods")
            .await
            .unwrap_err();
        match err {
            TransportError::Rejected { code, message } => {
                assert_eq!(code, 5003);
                assert_eq!(message, "quota exceeded");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_empty_event_payload_rejected() {
        let server = mockito::Server::new_async().await;
        let err = client(&server)
            .send_event_data(&[], "events/pods")
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::EmptyPayload));
    }

    #[tokio::test]
    async fn test_connection_refused_exhausts_retries() {
        let client = ControlPlaneClientBuilder::new()
            .endpoint("http://127.0.0.1:1")
            .api_key("secret")
            .cluster_id("c-1")
            .retry_max_attempts(2)
            .retry_delay(Duration::from_millis(5))
            .build()
            .unwrap();

        let err = client.send_cluster_deltas(b"{}").await.unwrap_err();
        assert!(matches!(err, TransportError::RetriesExhausted { attempts: 2, .. }));
    }
}
