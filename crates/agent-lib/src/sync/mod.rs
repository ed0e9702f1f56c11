//! Synchronization with the fleet control plane
//!
//! This module provides:
//! - HTTP client with API-key authentication, retries and gzip uploads
//! - Request and response bodies for the control plane API, including the
//!   rebalance node pool and node class uploads
//! - The periodic export loop that ships cluster snapshots

mod client;
mod exporter;
mod types;


pub use client::{ClientConfig, ControlPlaneClient, ControlPlaneClientBuilder, API_KEY_HEADER};
pub use exporter::{ExportConfig, ExportWorker, ExportWorkerBuilder, SnapshotUploader};
pub use types::{
    ClusterParams, Ec2NodeClass, Ec2NodePool, EcsNodeClass, EcsNodePool, Envelope,
    RebalanceConfiguration, RebalanceNodeClass, RebalanceNodeClassList, RebalanceNodePool,
    RebalanceNodePoolList, RebalanceState, RebalanceStatus, RebalanceWorkload,
    RegisterClusterRequest, WorkloadRebalanceConfiguration,
};
