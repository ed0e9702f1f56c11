//! In-memory cluster for tests

use super::ClusterReader;
use crate::error::ClusterError;
use crate::ledger::ResourceLedger;
use crate::models::{
    NodeInfo, NodeUsage, ObjectInfo, OwnerReference, PodCondition, PodInfo, PodPhase, PodUsage,
    WorkloadKind, WorkloadReplicas,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Default)]
pub(crate) struct FakeCluster {
    pub nodes: Vec<NodeInfo>,
    pub pods: Vec<PodInfo>,
    /// namespace name -> uid
    pub namespaces: HashMap<String, String>,
    /// (namespace, kind, name) -> object
    pub objects: HashMap<(String, String, String), ObjectInfo>,
    /// (namespace, name) -> replicas
    pub replicas: HashMap<(String, String), WorkloadReplicas>,
    pub node_usage: Vec<NodeUsage>,
    pub pod_usage: Vec<PodUsage>,
    pub fail_nodes: bool,
    pub fail_pods: bool,
    pub fail_pods_on_node: Option<String>,
    pub fail_usage: bool,
    pub owner_calls: AtomicUsize,
    pub replica_calls: AtomicUsize,
}

fn unavailable(kind: &str, name: &str) -> ClusterError {
    ClusterError::NotFound {
        kind: kind.to_string(),
        namespace: String::new(),
        name: name.to_string(),
    }
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_namespace(mut self, name: &str, uid: &str) -> Self {
        self.namespaces.insert(name.to_string(), uid.to_string());
        self
    }

    pub fn with_node(mut self, node: NodeInfo) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_pod(mut self, pod: PodInfo) -> Self {
        self.pods.push(pod);
        self
    }

    pub fn with_object(mut self, obj: ObjectInfo) -> Self {
        self.objects.insert(
            (obj.namespace.clone(), obj.kind.clone(), obj.name.clone()),
            obj,
        );
        self
    }

    pub fn with_replicas(
        mut self,
        namespace: &str,
        name: &str,
        replicas: WorkloadReplicas,
    ) -> Self {
        self.replicas
            .insert((namespace.to_string(), name.to_string()), replicas);
        self
    }
}

pub(crate) fn owner_ref(api_version: &str, kind: &str, name: &str) -> OwnerReference {
    OwnerReference {
        api_version: api_version.to_string(),
        kind: kind.to_string(),
        name: name.to_string(),
        uid: format!("{}-uid", name),
    }
}

pub(crate) fn object(
    api_version: &str,
    kind: &str,
    namespace: &str,
    name: &str,
    owner: Option<OwnerReference>,
) -> ObjectInfo {
    ObjectInfo {
        api_version: api_version.to_string(),
        kind: kind.to_string(),
        name: name.to_string(),
        namespace: namespace.to_string(),
        uid: format!("{}-uid", name),
        owner_references: owner.into_iter().collect(),
    }
}

pub(crate) fn node(name: &str, allocatable: &[(&str, &str)]) -> NodeInfo {
    let allocatable = ResourceLedger::parse(allocatable.iter().copied()).unwrap();
    NodeInfo {
        name: name.to_string(),
        labels: [("kubernetes.io/hostname".to_string(), name.to_string())]
            .into_iter()
            .collect(),
        internal_ips: vec![format!("10.0.0.{}", name.len())],
        capacity: allocatable.clone(),
        allocatable,
        ..Default::default()
    }
}

pub(crate) fn pod(
    namespace: &str,
    name: &str,
    node_name: &str,
    phase: PodPhase,
    requests: &[(&str, &str)],
    owner: Option<OwnerReference>,
) -> PodInfo {
    PodInfo {
        name: name.to_string(),
        namespace: namespace.to_string(),
        node_name: Some(node_name.to_string()),
        phase,
        owner_references: owner.into_iter().collect(),
        conditions: vec![PodCondition {
            condition_type: "Ready".to_string(),
            status: if phase == PodPhase::Running {
                "True".to_string()
            } else {
                "False".to_string()
            },
            reason: None,
        }],
        container_requests: vec![ResourceLedger::parse(requests.iter().copied()).unwrap()],
        ..Default::default()
    }
}

#[async_trait]
impl ClusterReader for FakeCluster {
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>, ClusterError> {
        if self.fail_nodes {
            return Err(unavailable("Node", "*"));
        }
        Ok(self.nodes.clone())
    }

    async fn list_pods(&self, node_name: Option<&str>) -> Result<Vec<PodInfo>, ClusterError> {
        if self.fail_pods {
            return Err(unavailable("Pod", "*"));
        }
        match node_name {
            Some(node) => {
                if self.fail_pods_on_node.as_deref() == Some(node) {
                    return Err(unavailable("Pod", node));
                }
                Ok(self
                    .pods
                    .iter()
                    .filter(|p| p.node_name.as_deref() == Some(node))
                    .cloned()
                    .collect())
            }
            None => Ok(self.pods.clone()),
        }
    }

    async fn get_namespace_uid(&self, namespace: &str) -> Result<String, ClusterError> {
        self.namespaces
            .get(namespace)
            .cloned()
            .ok_or_else(|| unavailable("Namespace", namespace))
    }

    async fn get_owner(
        &self,
        namespace: &str,
        owner: &OwnerReference,
    ) -> Result<ObjectInfo, ClusterError> {
        self.owner_calls.fetch_add(1, Ordering::SeqCst);
        self.objects
            .get(&(
                namespace.to_string(),
                owner.kind.clone(),
                owner.name.clone(),
            ))
            .cloned()
            .ok_or_else(|| ClusterError::NotFound {
                kind: owner.kind.clone(),
                namespace: namespace.to_string(),
                name: owner.name.clone(),
            })
    }

    async fn get_workload_replicas(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
    ) -> Result<WorkloadReplicas, ClusterError> {
        self.replica_calls.fetch_add(1, Ordering::SeqCst);
        if kind == WorkloadKind::Unsupported {
            return Err(ClusterError::UnsupportedKind(name.to_string()));
        }
        self.replicas
            .get(&(namespace.to_string(), name.to_string()))
            .copied()
            .ok_or_else(|| unavailable(&kind.to_string(), name))
    }

    async fn list_node_usage(
        &self,
        node_name: Option<&str>,
    ) -> Result<Vec<NodeUsage>, ClusterError> {
        if self.fail_usage {
            return Err(unavailable("NodeMetrics", "*"));
        }
        Ok(self
            .node_usage
            .iter()
            .filter(|u| node_name.map_or(true, |n| n == u.name))
            .cloned()
            .collect())
    }

    async fn list_pod_usage(&self) -> Result<Vec<PodUsage>, ClusterError> {
        if self.fail_usage {
            return Err(unavailable("PodMetrics", "*"));
        }
        Ok(self.pod_usage.clone())
    }
}
