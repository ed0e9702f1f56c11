//! Observability infrastructure for the fleet agent
//!
//! Provides:
//! - Prometheus metrics (export latency, pending deltas, transport failures)
//! - Structured JSON logging with tracing

use crate::ledger::ResourceRate;
use crate::models::EventType;
use prometheus::{
    register_gauge_vec, register_histogram, register_int_counter, register_int_counter_vec,
    register_int_gauge, GaugeVec, Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{debug, error, info, warn};

/// Histogram buckets for export cycle latency (in seconds)
const EXPORT_LATENCY_BUCKETS: &[f64] = &[
    0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<AgentMetricsInner> = OnceLock::new();

struct AgentMetricsInner {
    export_latency_seconds: Histogram,
    export_cycles: IntCounterVec,
    exported_bytes: IntCounter,
    pending_node_deltas: IntGauge,
    pending_workload_deltas: IntGauge,
    degraded_usage_reads: IntCounter,
    transport_failures: IntCounter,
    transport_retries: IntCounter,
    allocated_resource_rate: GaugeVec,
}

impl AgentMetricsInner {
    fn new() -> Self {
        Self {
            export_latency_seconds: register_histogram!(
                "fleet_agent_export_latency_seconds",
                "Time spent collecting, enriching and encoding a cluster snapshot",
                EXPORT_LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register export_latency_seconds"),

            export_cycles: register_int_counter_vec!(
                "fleet_agent_export_cycles_total",
                "Export cycles by outcome",
                &["outcome"]
            )
            .expect("Failed to register export_cycles"),

            exported_bytes: register_int_counter!(
                "fleet_agent_exported_bytes_total",
                "Bytes of encoded snapshots handed to the transport"
            )
            .expect("Failed to register exported_bytes"),

            pending_node_deltas: register_int_gauge!(
                "fleet_agent_pending_node_deltas",
                "Node deltas waiting for the next export"
            )
            .expect("Failed to register pending_node_deltas"),

            pending_workload_deltas: register_int_gauge!(
                "fleet_agent_pending_workload_deltas",
                "Workload deltas waiting for the next export"
            )
            .expect("Failed to register pending_workload_deltas"),

            degraded_usage_reads: register_int_counter!(
                "fleet_agent_degraded_usage_reads_total",
                "Usage metric reads that failed and were reported as empty"
            )
            .expect("Failed to register degraded_usage_reads"),

            transport_failures: register_int_counter!(
                "fleet_agent_transport_failures_total",
                "Control plane calls that failed after all retries"
            )
            .expect("Failed to register transport_failures"),

            transport_retries: register_int_counter!(
                "fleet_agent_transport_retries_total",
                "Control plane calls retried after a transient failure"
            )
            .expect("Failed to register transport_retries"),

            allocated_resource_rate: register_gauge_vec!(
                "fleet_agent_allocated_resource_rate",
                "Cluster requested / allocatable ratio per resource",
                &["resource"]
            )
            .expect("Failed to register allocated_resource_rate"),
        }
    }
}

/// Outcome label for `fleet_agent_export_cycles_total`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Flushed,
    NothingToSend,
    Aborted,
    SendFailed,
}

impl CycleOutcome {
    fn as_label(&self) -> &'static str {
        match self {
            CycleOutcome::Flushed => "flushed",
            CycleOutcome::NothingToSend => "nothing_to_send",
            CycleOutcome::Aborted => "aborted",
            CycleOutcome::SendFailed => "send_failed",
        }
    }
}

/// Agent metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct AgentMetrics {
    _private: (),
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &AgentMetricsInner {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new)
    }

    pub fn observe_export_latency(&self, duration_secs: f64) {
        self.inner().export_latency_seconds.observe(duration_secs);
    }

    pub fn inc_export_cycle(&self, outcome: CycleOutcome) {
        self.inner()
            .export_cycles
            .with_label_values(&[outcome.as_label()])
            .inc();
    }

    pub fn add_exported_bytes(&self, bytes: usize) {
        self.inner().exported_bytes.inc_by(bytes as u64);
    }

    pub fn set_pending_deltas(&self, nodes: usize, workloads: usize) {
        self.inner().pending_node_deltas.set(nodes as i64);
        self.inner().pending_workload_deltas.set(workloads as i64);
    }

    pub fn inc_degraded_usage_reads(&self) {
        self.inner().degraded_usage_reads.inc();
    }

    pub fn inc_transport_failures(&self) {
        self.inner().transport_failures.inc();
    }

    pub fn inc_transport_retries(&self) {
        self.inner().transport_retries.inc();
    }

    /// Replace the per-resource allocation rate gauges
    pub fn set_allocated_rate(&self, rate: &ResourceRate) {
        let gauge = &self.inner().allocated_resource_rate;
        gauge.reset();
        for (resource, value) in rate.iter() {
            gauge.with_label_values(&[resource]).set(value);
        }
    }
}

/// Structured logger for agent events
///
/// Every line carries an `event` field so cycle outcomes can be filtered
/// from the JSON log stream.
#[derive(Debug, Clone)]
pub struct StructuredLogger {
    cluster_id: String,
}

impl StructuredLogger {
    pub fn new(cluster_id: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
        }
    }

    /// Log agent startup
    pub fn log_startup(&self, version: &str, endpoint: &str) {
        info!(
            event = "agent_started",
            cluster_id = %self.cluster_id,
            agent_version = %version,
            endpoint = %endpoint,
            "Fleet agent started"
        );
    }

    /// Log agent shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            cluster_id = %self.cluster_id,
            reason = %reason,
            "Fleet agent shutting down"
        );
    }

    /// Log a snapshot that was encoded and the delta buffers reset
    pub fn log_export_flushed(
        &self,
        bytes: usize,
        node_deltas: usize,
        workload_deltas: usize,
        full_snapshot: bool,
    ) {
        info!(
            event = "export_flushed",
            cluster_id = %self.cluster_id,
            bytes = bytes,
            node_deltas = node_deltas,
            workload_deltas = workload_deltas,
            full_snapshot = full_snapshot,
            "Encoded cluster snapshot"
        );
    }

    /// Log a delta-only cycle with nothing pending
    pub fn log_export_skipped(&self) {
        info!(
            event = "export_nothing_to_send",
            cluster_id = %self.cluster_id,
            "No pending deltas, skipping export"
        );
    }

    /// Log a cycle aborted before encoding finished
    pub fn log_export_aborted(&self, reason: &str) {
        error!(
            event = "export_aborted",
            cluster_id = %self.cluster_id,
            reason = %reason,
            "Export cycle aborted, pending deltas kept"
        );
    }

    /// Log sync status with the control plane
    pub fn log_sync_status(&self, delivered: bool, requeued_deltas: usize) {
        if delivered {
            info!(
                event = "api_sync",
                cluster_id = %self.cluster_id,
                delivered = true,
                "Delivered snapshot to control plane"
            );
        } else {
            warn!(
                event = "api_sync",
                cluster_id = %self.cluster_id,
                delivered = false,
                requeued_deltas = requeued_deltas,
                "Failed to deliver snapshot, deltas requeued"
            );
        }
    }

    /// Log a node or workload event entering the delta buffers
    pub fn log_delta_recorded(&self, kind: &str, key: &str, event: EventType) {
        debug!(
            event = "delta_recorded",
            cluster_id = %self.cluster_id,
            kind = %kind,
            key = %key,
            change = ?event,
            "Recorded pending delta"
        );
    }

    /// Log cluster registration
    pub fn log_registered(&self, cluster_id: &str) {
        info!(
            event = "cluster_registered",
            cluster_id = %cluster_id,
            "Registered cluster with control plane"
        );
    }
}
