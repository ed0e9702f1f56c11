//! kube-backed cluster reader

use super::metrics::{NodeMetrics, PodMetrics};
use super::ClusterReader;
use crate::error::{ClusterError, QuantityError};
use crate::ledger::ResourceLedger;
use crate::models::{
    NodeCondition, NodeInfo, NodeUsage, ObjectInfo, OwnerReference, PodCondition, PodInfo,
    PodPhase, PodUsage, WorkloadKind, WorkloadReplicas,
};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Namespace, Node, Pod};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity as KubeQuantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference as KubeOwnerReference;
use kube::api::{Api, ListParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::Client;
use std::collections::BTreeMap;
use tracing::debug;

/// Reads cluster state through the Kubernetes API server
#[derive(Clone)]
pub struct KubeClusterReader {
    client: Client,
}

impl KubeClusterReader {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect using in-cluster config or the local kubeconfig
    pub async fn try_default() -> Result<Self, ClusterError> {
        let client = Client::try_default().await?;
        Ok(Self::new(client))
    }
}

fn not_found_or(err: kube::Error, kind: &str, namespace: &str, name: &str) -> ClusterError {
    match err {
        kube::Error::Api(resp) if resp.code == 404 => ClusterError::NotFound {
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        },
        other => ClusterError::Kube(other),
    }
}

fn ledger(map: Option<BTreeMap<String, KubeQuantity>>) -> Result<ResourceLedger, QuantityError> {
    let map = map.unwrap_or_default();
    ResourceLedger::parse(map.iter().map(|(name, q)| (name.as_str(), q.0.as_str())))
}

fn owner_reference(owner: KubeOwnerReference) -> OwnerReference {
    OwnerReference {
        api_version: owner.api_version,
        kind: owner.kind,
        name: owner.name,
        uid: owner.uid,
    }
}

fn node_info(node: Node) -> Result<NodeInfo, ClusterError> {
    let metadata = node.metadata;
    let status = node.status.unwrap_or_default();

    let internal_ips = status
        .addresses
        .unwrap_or_default()
        .into_iter()
        .filter(|a| a.type_ == "InternalIP")
        .map(|a| a.address)
        .collect();

    let ready_condition = status
        .conditions
        .unwrap_or_default()
        .into_iter()
        .find(|c| c.type_ == "Ready")
        .map(|c| NodeCondition {
            status: c.status,
            message: c.message.unwrap_or_default(),
            last_transition_time: c.last_transition_time.map(|t| t.0),
        });

    Ok(NodeInfo {
        name: metadata.name.ok_or(ClusterError::MissingField("metadata.name"))?,
        labels: metadata.labels.unwrap_or_default(),
        annotations: metadata.annotations.unwrap_or_default(),
        internal_ips,
        allocatable: ledger(status.allocatable)?,
        capacity: ledger(status.capacity)?,
        ready_condition,
        creation_timestamp: metadata.creation_timestamp.map(|t| t.0),
        deletion_timestamp: metadata.deletion_timestamp.map(|t| t.0),
    })
}

fn pod_info(pod: Pod) -> Result<PodInfo, ClusterError> {
    let metadata = pod.metadata;
    let spec = pod.spec.unwrap_or_default();
    let status = pod.status.unwrap_or_default();

    let container_requests = spec
        .containers
        .into_iter()
        .map(|c| ledger(c.resources.and_then(|r| r.requests)))
        .collect::<Result<Vec<_>, _>>()?;

    let conditions = status
        .conditions
        .unwrap_or_default()
        .into_iter()
        .map(|c| PodCondition {
            condition_type: c.type_,
            status: c.status,
            reason: c.reason,
        })
        .collect();

    Ok(PodInfo {
        name: metadata.name.ok_or(ClusterError::MissingField("metadata.name"))?,
        namespace: metadata.namespace.unwrap_or_default(),
        node_name: spec.node_name,
        phase: status
            .phase
            .as_deref()
            .map(PodPhase::parse)
            .unwrap_or(PodPhase::Unknown),
        owner_references: metadata
            .owner_references
            .unwrap_or_default()
            .into_iter()
            .map(owner_reference)
            .collect(),
        annotations: metadata.annotations.unwrap_or_default(),
        conditions,
        container_requests,
        deletion_timestamp: metadata.deletion_timestamp.map(|t| t.0),
    })
}

fn object_info(obj: DynamicObject, owner: &OwnerReference, namespace: &str) -> ObjectInfo {
    let (api_version, kind) = match obj.types {
        Some(types) => (types.api_version, types.kind),
        None => (owner.api_version.clone(), owner.kind.clone()),
    };

    ObjectInfo {
        api_version,
        kind,
        name: obj.metadata.name.unwrap_or_else(|| owner.name.clone()),
        namespace: obj
            .metadata
            .namespace
            .unwrap_or_else(|| namespace.to_string()),
        uid: obj.metadata.uid.unwrap_or_default(),
        owner_references: obj
            .metadata
            .owner_references
            .unwrap_or_default()
            .into_iter()
            .map(owner_reference)
            .collect(),
    }
}

#[async_trait]
impl ClusterReader for KubeClusterReader {
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>, ClusterError> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let list = nodes.list(&ListParams::default()).await?;
        list.items.into_iter().map(node_info).collect()
    }

    async fn list_pods(&self, node_name: Option<&str>) -> Result<Vec<PodInfo>, ClusterError> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let params = match node_name {
            Some(node) => ListParams::default().fields(&format!("spec.nodeName={node}")),
            None => ListParams::default(),
        };
        let list = pods.list(&params).await?;
        list.items.into_iter().map(pod_info).collect()
    }

    async fn get_namespace_uid(&self, namespace: &str) -> Result<String, ClusterError> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        let ns = namespaces
            .get(namespace)
            .await
            .map_err(|e| not_found_or(e, "Namespace", "", namespace))?;
        ns.metadata.uid.ok_or(ClusterError::MissingField("metadata.uid"))
    }

    async fn get_owner(
        &self,
        namespace: &str,
        owner: &OwnerReference,
    ) -> Result<ObjectInfo, ClusterError> {
        let (group, version) = owner
            .api_version
            .rsplit_once('/')
            .unwrap_or(("", owner.api_version.as_str()));
        let gvk = GroupVersionKind::gvk(group, version, &owner.kind);
        let resource = ApiResource::from_gvk(&gvk);

        debug!(
            namespace = %namespace,
            kind = %owner.kind,
            name = %owner.name,
            "Fetching owner object"
        );

        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &resource);
        let obj = api
            .get(&owner.name)
            .await
            .map_err(|e| not_found_or(e, &owner.kind, namespace, &owner.name))?;

        Ok(object_info(obj, owner, namespace))
    }

    async fn get_workload_replicas(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
    ) -> Result<WorkloadReplicas, ClusterError> {
        let client = self.client.clone();
        let replicas = match kind {
            WorkloadKind::Deployment => {
                let api: Api<Deployment> = Api::namespaced(client, namespace);
                let deployment = api
                    .get(name)
                    .await
                    .map_err(|e| not_found_or(e, "Deployment", namespace, name))?;
                WorkloadReplicas {
                    spec_replicas: deployment.spec.and_then(|s| s.replicas),
                    ..Default::default()
                }
            }
            WorkloadKind::StatefulSet => {
                let api: Api<StatefulSet> = Api::namespaced(client, namespace);
                let statefulset = api
                    .get(name)
                    .await
                    .map_err(|e| not_found_or(e, "StatefulSet", namespace, name))?;
                WorkloadReplicas {
                    spec_replicas: statefulset.spec.and_then(|s| s.replicas),
                    ..Default::default()
                }
            }
            WorkloadKind::DaemonSet => {
                let api: Api<DaemonSet> = Api::namespaced(client, namespace);
                let daemonset = api
                    .get(name)
                    .await
                    .map_err(|e| not_found_or(e, "DaemonSet", namespace, name))?;
                WorkloadReplicas {
                    spec_replicas: None,
                    desired_number_scheduled: daemonset
                        .status
                        .map(|s| s.desired_number_scheduled)
                        .unwrap_or(0),
                }
            }
            WorkloadKind::Unsupported => {
                return Err(ClusterError::UnsupportedKind(format!(
                    "{namespace}/{name}"
                )))
            }
        };
        Ok(replicas)
    }

    async fn list_node_usage(
        &self,
        node_name: Option<&str>,
    ) -> Result<Vec<NodeUsage>, ClusterError> {
        let api: Api<NodeMetrics> = Api::all(self.client.clone());
        let params = match node_name {
            Some(node) => ListParams::default().fields(&format!("metadata.name={node}")),
            None => ListParams::default(),
        };
        let list = api.list(&params).await?;

        list.items
            .into_iter()
            .map(|m| -> Result<NodeUsage, ClusterError> {
                Ok(NodeUsage {
                    name: m.metadata.name.unwrap_or_default(),
                    usage: ledger(Some(m.usage))?,
                })
            })
            .collect()
    }

    async fn list_pod_usage(&self) -> Result<Vec<PodUsage>, ClusterError> {
        let api: Api<PodMetrics> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await?;

        list.items
            .into_iter()
            .map(|m| -> Result<PodUsage, ClusterError> {
                let containers = m
                    .containers
                    .into_iter()
                    .map(|c| ledger(Some(c.usage)))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(PodUsage {
                    namespace: m.metadata.namespace.unwrap_or_default(),
                    name: m.metadata.name.unwrap_or_default(),
                    containers,
                })
            })
            .collect()
    }
}
