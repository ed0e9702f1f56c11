//! Fleet Agent - cluster delta tracking and snapshot export
//!
//! Runs as a single Deployment per cluster, registers the cluster with the
//! control plane and periodically ships resource snapshots to it.

use agent_lib::{
    cluster::{ClusterReader, KubeClusterReader},
    delta::DeltaStore,
    health::{components, HealthRegistry},
    observability::{AgentMetrics, StructuredLogger},
    sync::{ClusterParams, ControlPlaneClient, ExportWorkerBuilder, RegisterClusterRequest},
};
use anyhow::{Context, Result};
use fleet_agent::{api, config::AgentConfig};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);
const ARCH_LABEL: &str = "kubernetes.io/arch";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting fleet-agent");

    let config = AgentConfig::load()?;

    let health_registry = HealthRegistry::with_agent_components().await;
    let metrics = AgentMetrics::new();

    let app_state = Arc::new(api::AppState::new(health_registry.clone(), metrics));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    let reader: Arc<dyn ClusterReader> = Arc::new(
        KubeClusterReader::try_default()
            .await
            .context("Failed to create Kubernetes client")?,
    );
    let client = Arc::new(
        ControlPlaneClient::new(config.client_config())
            .context("Failed to create control plane client")?,
    );

    let cluster_id = if config.cluster_id.is_empty() {
        let request = registration_request(&config, reader.as_ref()).await;
        client
            .register_cluster(&request)
            .await
            .context("Failed to register cluster")?
    } else {
        config.cluster_id.clone()
    };

    let logger = StructuredLogger::new(&cluster_id);
    logger.log_registered(&cluster_id);
    logger.log_startup(AGENT_VERSION, client.endpoint());
    health_registry.set_ready(true).await;

    let (shutdown_tx, _) = broadcast::channel(1);

    let store = Arc::new(DeltaStore::new().with_logger(logger.clone()));
    let worker = ExportWorkerBuilder::new()
        .config(config.export_config())
        .reader(reader)
        .store(store)
        .uploader(client.clone())
        .health(health_registry.clone())
        .cluster_id(&cluster_id)
        .build()?;
    let export_handle = tokio::spawn(worker.run(shutdown_tx.subscribe()));

    let heartbeat_handle = tokio::spawn(heartbeat_loop(
        client,
        health_registry.clone(),
        shutdown_tx.subscribe(),
    ));

    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");
    health_registry.set_ready(false).await;

    let _ = shutdown_tx.send(());
    let _ = export_handle.await;
    let _ = heartbeat_handle.await;
    api_handle.abort();

    info!("Shutdown complete");
    Ok(())
}

/// Registration body describing this cluster
///
/// Node architectures are read from the live node list; a failed read
/// registers without them.
async fn registration_request(
    config: &AgentConfig,
    reader: &dyn ClusterReader,
) -> RegisterClusterRequest {
    let arch: BTreeSet<String> = match reader.list_nodes().await {
        Ok(nodes) => nodes
            .iter()
            .filter_map(|n| n.labels.get(ARCH_LABEL).cloned())
            .collect(),
        Err(e) => {
            warn!(error = %e, "Failed to list nodes for registration");
            BTreeSet::new()
        }
    };

    RegisterClusterRequest {
        demo: false,
        agent_version: AGENT_VERSION.to_string(),
        cloud_provider: config.cloud_provider,
        gpu_instances: Vec::new(),
        arch: arch.into_iter().collect(),
        eks: None,
        cluster_params: Some(ClusterParams {
            cluster_name: config.cluster_name.clone(),
            cluster_version: String::new(),
            region: config.region.clone(),
            account_id: config.account_id.clone(),
        }),
    }
}

async fn heartbeat_loop(
    client: Arc<ControlPlaneClient>,
    health: HealthRegistry,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match client.send_heartbeat().await {
                    Ok(()) => health.set_healthy(components::CONTROL_PLANE).await,
                    Err(e) => {
                        warn!(error = %e, "Heartbeat failed");
                        health.record_failure(components::CONTROL_PLANE, e.to_string()).await;
                    }
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}
