//! Cluster snapshot encoding
//!
//! One export cycle moves through
//! `Idle -> Collecting -> Enriching -> Encoding -> Flushed | Aborted`.
//! Both delta locks are held from the start of collection until the buffers
//! have been cleared, so producers briefly block while the cluster is read.
//! Buffers are cleared only after the bytes are fixed; any failure before
//! that leaves them untouched for the next cycle.

use crate::cluster::ClusterReader;
use crate::delta::{DeltaGuard, DeltaStore, PendingDeltas};
use crate::error::{ClusterError, ExportError};
use crate::ledger::{ResourceLedger, ResourceRate};
use crate::models::{sum_cpu_memory, NodeDelta, NodeInfo, KARPENTER_NODEPOOL_LABEL};
use crate::observability::AgentMetrics;
use crate::workload::{NamespacesKindsWorkloadsResources, WorkloadAggregator};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Wire shape of one export
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSnapshot {
    #[serde(flatten)]
    pub deltas: PendingDeltas,
    /// No live node is outside fleet management
    pub updated_after_rebalance: bool,
    pub cluster_used_resource: ResourceLedger,
    pub cluster_request_resource: ResourceLedger,
    pub cluster_allocatable_resource: ResourceLedger,
    pub namespaces_kinds_workloads_resources: NamespacesKindsWorkloadsResources,
    pub cluster_allocated_resource_rate: ResourceRate,
}

/// Bytes ready for the transport plus the pre-reset copy they were made from
#[derive(Debug, Clone)]
pub struct EncodedSnapshot {
    pub bytes: Vec<u8>,
    pub snapshot: ClusterSnapshot,
}

/// Phase of the export cycle state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExportPhase {
    Idle = 0,
    Collecting = 1,
    Enriching = 2,
    Encoding = 3,
    Flushed = 4,
    Aborted = 5,
}

impl ExportPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ExportPhase::Collecting,
            2 => ExportPhase::Enriching,
            3 => ExportPhase::Encoding,
            4 => ExportPhase::Flushed,
            5 => ExportPhase::Aborted,
            _ => ExportPhase::Idle,
        }
    }
}

/// Produces encoded snapshots from live cluster state and pending deltas
pub struct SnapshotEncoder {
    reader: Arc<dyn ClusterReader>,
    store: Arc<DeltaStore>,
    anonymize: bool,
    metrics: AgentMetrics,
    phase: AtomicU8,
}

impl SnapshotEncoder {
    pub fn new(reader: Arc<dyn ClusterReader>, store: Arc<DeltaStore>) -> Self {
        Self {
            reader,
            store,
            anonymize: false,
            metrics: AgentMetrics::new(),
            phase: AtomicU8::new(ExportPhase::Idle as u8),
        }
    }

    /// Leave workload names and namespaces out of the snapshot
    pub fn anonymize(mut self, anonymize: bool) -> Self {
        self.anonymize = anonymize;
        self
    }

    pub fn store(&self) -> &Arc<DeltaStore> {
        &self.store
    }

    /// Phase the most recent cycle reached
    pub fn phase(&self) -> ExportPhase {
        ExportPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    fn enter(&self, phase: ExportPhase) {
        trace!(phase = ?phase, "Export phase");
        self.phase.store(phase as u8, Ordering::SeqCst);
    }

    /// Run one export cycle
    ///
    /// With `deltas_only` set and nothing pending, returns `Ok(None)` without
    /// touching the buffers. Otherwise returns the encoded snapshot and clears
    /// both delta maps.
    pub async fn encode(&self, deltas_only: bool) -> Result<Option<EncodedSnapshot>, ExportError> {
        self.enter(ExportPhase::Collecting);
        let mut guard = self.store.lock().await;

        match self.encode_locked(&mut guard, deltas_only).await {
            Ok(Some(encoded)) => {
                guard.clear();
                self.enter(ExportPhase::Flushed);
                Ok(Some(encoded))
            }
            Ok(None) => {
                self.enter(ExportPhase::Idle);
                Ok(None)
            }
            Err(e) => {
                self.enter(ExportPhase::Aborted);
                Err(e)
            }
        }
    }

    async fn encode_locked(
        &self,
        guard: &mut DeltaGuard<'_>,
        deltas_only: bool,
    ) -> Result<Option<EncodedSnapshot>, ExportError> {
        let nodes = self
            .reader
            .list_nodes()
            .await
            .map_err(ExportError::NodeList)?;

        if deltas_only && guard.is_empty() {
            debug!("No pending deltas");
            return Ok(None);
        }

        self.enter(ExportPhase::Enriching);

        let updated_after_rebalance = !self.contains_unmanaged_nodes(&nodes).await;
        let allocatable = ResourceLedger::sum(nodes.iter().map(|n| &n.allocatable));
        let used = self.cluster_used().await;

        let aggregation = WorkloadAggregator::new(self.reader.as_ref())
            .anonymize(self.anonymize)
            .aggregate()
            .await?;
        let rate = ResourceRate::calculate(&allocatable, &aggregation.cluster_requests);

        let live: HashMap<&str, &NodeInfo> = nodes.iter().map(|n| (n.name.as_str(), n)).collect();
        for (name, delta) in guard.nodes.iter_mut() {
            // Deleted nodes keep their last known values
            let Some(node) = live.get(name.as_str()) else {
                continue;
            };
            if let Err(e) = self.refresh_node_delta(delta, node).await {
                warn!(
                    node = %name,
                    error = %e,
                    "Failed to refresh node delta, keeping previous values"
                );
            }
        }

        self.enter(ExportPhase::Encoding);

        let snapshot = ClusterSnapshot {
            deltas: PendingDeltas {
                node_deltas: guard.nodes.clone(),
                workload_deltas: guard.workloads.clone(),
            },
            updated_after_rebalance,
            cluster_used_resource: used,
            cluster_request_resource: aggregation.cluster_requests,
            cluster_allocatable_resource: allocatable,
            namespaces_kinds_workloads_resources: aggregation.workloads,
            cluster_allocated_resource_rate: rate,
        };
        let bytes = serde_json::to_vec(&snapshot)?;

        Ok(Some(EncodedSnapshot { bytes, snapshot }))
    }

    /// Cluster-wide cpu/memory usage, empty when the metrics API fails
    async fn cluster_used(&self) -> ResourceLedger {
        match self.reader.list_node_usage(None).await {
            Ok(usage) => sum_cpu_memory(usage.iter().map(|u| &u.usage)),
            Err(e) => {
                warn!(error = %e, "Failed to read node metrics, reporting cluster usage as empty");
                self.metrics.inc_degraded_usage_reads();
                ResourceLedger::new()
            }
        }
    }

    /// Whether any live node sits outside fleet management
    ///
    /// Nodes that cannot be disrupted, or whose pods cannot be listed, are
    /// ignored.
    async fn contains_unmanaged_nodes(&self, nodes: &[NodeInfo]) -> bool {
        for node in nodes {
            if node.labels.is_empty() {
                return true;
            }
            match self.is_rebalanceable(node).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    debug!(node = %node.name, error = %e, "Skipping node in managed check");
                    continue;
                }
            }
            if !node.labels.contains_key(KARPENTER_NODEPOOL_LABEL) {
                return true;
            }
        }
        false
    }

    async fn is_rebalanceable(&self, node: &NodeInfo) -> Result<bool, ClusterError> {
        if node.do_not_disrupt() {
            return Ok(false);
        }
        let pods = self.reader.list_pods(Some(&node.name)).await?;
        Ok(!pods
            .iter()
            .filter(|p| p.is_reschedulable())
            .any(|p| p.do_not_disrupt()))
    }

    /// Overwrite a buffered delta's live fields from the current node state
    ///
    /// The delta is left unchanged when the node's pods cannot be listed.
    async fn refresh_node_delta(
        &self,
        delta: &mut NodeDelta,
        node: &NodeInfo,
    ) -> Result<(), ClusterError> {
        let used = match self.reader.list_node_usage(Some(&node.name)).await {
            Ok(usage) => sum_cpu_memory(usage.iter().map(|u| &u.usage)),
            Err(e) => {
                warn!(node = %node.name, error = %e, "Failed to read node metrics");
                self.metrics.inc_degraded_usage_reads();
                ResourceLedger::new()
            }
        };

        let pods = self.reader.list_pods(Some(&node.name)).await?;

        let mut requested = ResourceLedger::new();
        let mut ready = 0;
        for pod in &pods {
            if pod.counts_toward_requests() {
                requested += &pod.requests();
            }
            if pod.is_ready() {
                ready += 1;
            }
        }

        delta.ip_address = node.internal_ips.clone();
        delta.used_resources = used;
        delta.request_resources = requested;
        delta.allocatable_resources = node.allocatable.clone();
        delta.provisioned_resources = node.capacity.clone();
        delta.ready_pod_number = ready;
        delta.not_ready_pod_number = pods.len() as u32 - ready;
        Ok(())
    }
}
