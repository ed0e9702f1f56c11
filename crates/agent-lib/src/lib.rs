//! Agent library for cluster delta tracking and snapshot export
//!
//! This crate provides the core functionality for:
//! - Resource quantity accounting
//! - Cluster reads and root owner resolution
//! - Per-workload resource aggregation
//! - Buffering of node and workload change events
//! - Snapshot encoding and delivery to the control plane
//! - Health checks and observability

pub mod cluster;
pub mod delta;
pub mod error;
pub mod health;
pub mod ledger;
pub mod models;
pub mod observability;
pub mod snapshot;
pub mod sync;
pub mod workload;

pub use cluster::{ClusterReader, KubeClusterReader};
pub use delta::{DeltaStore, PendingDeltas};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use ledger::{Quantity, ResourceLedger, ResourceRate};
pub use models::*;
pub use observability::{AgentMetrics, StructuredLogger};
pub use snapshot::{ClusterSnapshot, ExportPhase, SnapshotEncoder};
