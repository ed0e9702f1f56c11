//! Read access to the cluster API
//!
//! Everything the export cycle learns about live cluster state goes through
//! the `ClusterReader` trait: list/get verbs only, no watches. The kube-backed
//! implementation lives in `reader`; tests use an in-memory fake.

mod metrics;
mod owner;
mod reader;

#[cfg(test)]
pub(crate) mod fake;

pub use metrics::{NodeMetrics, PodMetrics, PodMetricsContainer};
pub use owner::{resolve_root_owner, MAX_OWNER_DEPTH};
pub use reader::KubeClusterReader;

use crate::error::ClusterError;
use crate::models::{
    NodeInfo, NodeUsage, ObjectInfo, OwnerReference, PodInfo, PodUsage, WorkloadKind,
    WorkloadReplicas,
};
use async_trait::async_trait;

/// List/get access to live cluster objects and usage metrics
///
/// Dropping a returned future cancels the call.
#[async_trait]
pub trait ClusterReader: Send + Sync {
    /// List all nodes
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>, ClusterError>;

    /// List pods, optionally only those bound to `node_name`
    async fn list_pods(&self, node_name: Option<&str>) -> Result<Vec<PodInfo>, ClusterError>;

    /// UID of a namespace
    async fn get_namespace_uid(&self, namespace: &str) -> Result<String, ClusterError>;

    /// Fetch the object an owner reference points at
    async fn get_owner(
        &self,
        namespace: &str,
        owner: &OwnerReference,
    ) -> Result<ObjectInfo, ClusterError>;

    /// Replica fields of a workload controller
    async fn get_workload_replicas(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
    ) -> Result<WorkloadReplicas, ClusterError>;

    /// Node usage from the metrics API, optionally for a single node
    async fn list_node_usage(&self, node_name: Option<&str>)
        -> Result<Vec<NodeUsage>, ClusterError>;

    /// Pod usage from the metrics API across all namespaces
    async fn list_pod_usage(&self) -> Result<Vec<PodUsage>, ClusterError>;
}
