//! Periodic snapshot export
//!
//! A single worker ticks on a fixed interval, encodes pending deltas (with a
//! full snapshot every Nth cycle) and uploads the result. When an upload
//! fails, the pre-reset copy is merged back into the delta store so the
//! next cycle ships it again; events recorded in the meantime win.

use super::client::ControlPlaneClient;
use crate::cluster::ClusterReader;
use crate::delta::DeltaStore;
use crate::error::TransportError;
use crate::health::{components, HealthRegistry};
use crate::observability::{AgentMetrics, CycleOutcome, StructuredLogger};
use crate::snapshot::{EncodedSnapshot, SnapshotEncoder};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Destination for encoded snapshots
#[async_trait]
pub trait SnapshotUploader: Send + Sync {
    async fn upload(&self, data: &[u8]) -> Result<(), TransportError>;
}

#[async_trait]
impl SnapshotUploader for ControlPlaneClient {
    async fn upload(&self, data: &[u8]) -> Result<(), TransportError> {
        self.send_cluster_deltas(data).await
    }
}

/// Configuration for the export loop
#[derive(Debug, Clone)]
pub struct ExportConfig {
    pub interval: Duration,
    /// Ship a full snapshot every N cycles, starting with the first; 0 never does
    pub full_snapshot_every: u32,
    /// Leave workload names and namespaces out of uploads
    pub anonymize: bool,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            full_snapshot_every: 10,
            anonymize: false,
        }
    }
}

/// Background export worker
pub struct ExportWorker {
    config: ExportConfig,
    encoder: SnapshotEncoder,
    uploader: Arc<dyn SnapshotUploader>,
    health: HealthRegistry,
    metrics: AgentMetrics,
    logger: StructuredLogger,
    cycle: u64,
}

impl ExportWorker {
    /// Run until a shutdown signal arrives
    ///
    /// Shutdown interrupts the interval wait and an in-flight upload. An
    /// encode that has started always completes.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            full_snapshot_every = self.config.full_snapshot_every,
            "Starting export loop"
        );

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Ok(encoded) = self.collect().await else {
                        continue;
                    };

                    tokio::select! {
                        result = self.uploader.upload(&encoded.bytes) => {
                            self.finish(encoded, result).await;
                        }
                        _ = shutdown.recv() => {
                            self.requeue(&encoded).await;
                            self.logger.log_shutdown("upload interrupted");
                            break;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down export loop");
                    break;
                }
            }
        }
    }

    /// Encode and upload once
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        let encoded = match self.collect().await {
            Ok(encoded) => encoded,
            Err(outcome) => return outcome,
        };
        let result = self.uploader.upload(&encoded.bytes).await;
        self.finish(encoded, result).await
    }

    fn next_is_full(&mut self) -> bool {
        let every = u64::from(self.config.full_snapshot_every);
        let full = every > 0 && self.cycle % every == 0;
        self.cycle += 1;
        full
    }

    /// Encoding half of a cycle; `Err` carries the outcome when there is nothing to upload
    async fn collect(&mut self) -> Result<EncodedSnapshot, CycleOutcome> {
        let full = self.next_is_full();
        let start = Instant::now();
        let result = self.encoder.encode(!full).await;
        self.metrics
            .observe_export_latency(start.elapsed().as_secs_f64());

        match result {
            Ok(Some(encoded)) => {
                self.health.set_healthy(components::EXPORTER).await;
                self.health.set_healthy(components::CLUSTER_READER).await;
                self.metrics.add_exported_bytes(encoded.bytes.len());
                self.metrics
                    .set_allocated_rate(&encoded.snapshot.cluster_allocated_resource_rate);
                self.logger.log_export_flushed(
                    encoded.bytes.len(),
                    encoded.snapshot.deltas.node_deltas.len(),
                    encoded.snapshot.deltas.workload_deltas.len(),
                    full,
                );
                Ok(encoded)
            }
            Ok(None) => {
                self.health.set_healthy(components::EXPORTER).await;
                self.logger.log_export_skipped();
                Err(self.record(CycleOutcome::NothingToSend).await)
            }
            Err(e) => {
                let reason = e.to_string();
                self.health
                    .record_failure(components::EXPORTER, reason.clone())
                    .await;
                self.health
                    .record_failure(components::CLUSTER_READER, reason.clone())
                    .await;
                self.logger.log_export_aborted(&reason);
                Err(self.record(CycleOutcome::Aborted).await)
            }
        }
    }

    /// Upload half of a cycle
    async fn finish(
        &self,
        encoded: EncodedSnapshot,
        result: Result<(), TransportError>,
    ) -> CycleOutcome {
        match result {
            Ok(()) => {
                self.health.set_healthy(components::CONTROL_PLANE).await;
                self.logger.log_sync_status(true, 0);
                self.record(CycleOutcome::Flushed).await
            }
            Err(e) => {
                warn!(error = %e, "Snapshot upload failed");
                self.health
                    .record_failure(components::CONTROL_PLANE, e.to_string())
                    .await;
                let requeued = self.requeue(&encoded).await;
                self.logger.log_sync_status(false, requeued);
                self.record(CycleOutcome::SendFailed).await
            }
        }
    }

    /// Put the deltas of an undelivered snapshot back, returning how many were shipped
    async fn requeue(&self, encoded: &EncodedSnapshot) -> usize {
        let deltas = &encoded.snapshot.deltas;
        self.encoder.store().merge_if_absent(deltas).await;
        let requeued = deltas.node_deltas.len() + deltas.workload_deltas.len();
        debug!(requeued, "Merged undelivered deltas back");
        requeued
    }

    async fn record(&self, outcome: CycleOutcome) -> CycleOutcome {
        self.metrics.inc_export_cycle(outcome);
        let (nodes, workloads) = self.encoder.store().pending_counts().await;
        self.metrics.set_pending_deltas(nodes, workloads);
        outcome
    }
}

/// Builder for creating the export worker
pub struct ExportWorkerBuilder {
    config: ExportConfig,
    reader: Option<Arc<dyn ClusterReader>>,
    store: Option<Arc<DeltaStore>>,
    uploader: Option<Arc<dyn SnapshotUploader>>,
    health: Option<HealthRegistry>,
    cluster_id: String,
}

impl ExportWorkerBuilder {
    pub fn new() -> Self {
        Self {
            config: ExportConfig::default(),
            reader: None,
            store: None,
            uploader: None,
            health: None,
            cluster_id: String::new(),
        }
    }

    pub fn config(mut self, config: ExportConfig) -> Self {
        self.config = config;
        self
    }

    pub fn reader(mut self, reader: Arc<dyn ClusterReader>) -> Self {
        self.reader = Some(reader);
        self
    }

    pub fn store(mut self, store: Arc<DeltaStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn uploader(mut self, uploader: Arc<dyn SnapshotUploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn cluster_id(mut self, id: impl Into<String>) -> Self {
        self.cluster_id = id.into();
        self
    }

    pub fn build(self) -> Result<ExportWorker> {
        let reader = self
            .reader
            .ok_or_else(|| anyhow::anyhow!("Cluster reader is required"))?;
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("Delta store is required"))?;
        let uploader = self
            .uploader
            .ok_or_else(|| anyhow::anyhow!("Uploader is required"))?;

        let encoder = SnapshotEncoder::new(reader, store).anonymize(self.config.anonymize);

        Ok(ExportWorker {
            config: self.config,
            encoder,
            uploader,
            health: self.health.unwrap_or_default(),
            metrics: AgentMetrics::new(),
            logger: StructuredLogger::new(self.cluster_id),
            cycle: 0,
        })
    }
}

impl Default for ExportWorkerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
