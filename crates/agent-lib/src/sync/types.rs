//! Control plane request and response bodies

use crate::models::CloudProvider;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Envelope wrapped around every control plane response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Envelope {
    /// Codes the control plane uses for success
    pub fn is_success(&self) -> bool {
        self.code == 0 || self.code == 200
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterParams {
    pub cluster_name: String,
    pub cluster_version: String,
    pub region: String,
    pub account_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterClusterRequest {
    pub demo: bool,
    pub agent_version: String,
    pub cloud_provider: CloudProvider,
    pub gpu_instances: Vec<String>,
    pub arch: Vec<String>,
    /// EKS-specific parameters, null for other providers
    pub eks: Option<ClusterParams>,
    pub cluster_params: Option<ClusterParams>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RegisterClusterResponse {
    #[serde(default)]
    pub cluster_id: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebalanceConfiguration {
    /// The agent should upload the node pool configuration it sees
    #[serde(default)]
    pub upload_config: bool,
    pub enable: bool,
    #[serde(default)]
    pub enable_diversity_instance_type: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RebalanceState {
    #[default]
    Applying,
    LaunchingReplacements,
    Draining,
    Terminating,
    Failed,
    Success,
}

impl fmt::Display for RebalanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RebalanceState::Applying => "Applying",
            RebalanceState::LaunchingReplacements => "LaunchingReplacements",
            RebalanceState::Draining => "Draining",
            RebalanceState::Terminating => "Terminating",
            RebalanceState::Failed => "Failed",
            RebalanceState::Success => "Success",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebalanceStatus {
    #[serde(default)]
    pub state: RebalanceState,
    pub last_components_active_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub message: String,
}

/// Karpenter NodePool as the control plane stores it for AWS clusters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ec2NodePool {
    pub name: String,
    pub enable: bool,
    #[serde(default)]
    pub node_pool_annotation: Option<BTreeMap<String, String>>,
    /// `spec` of the NodePool object, kept opaque
    pub node_pool_spec: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ec2NodeClass {
    pub name: String,
    #[serde(default)]
    pub node_class_annotation: Option<BTreeMap<String, String>>,
    pub node_class_spec: serde_json::Value,
}

/// Karpenter NodePool for Alibaba Cloud clusters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EcsNodePool {
    pub name: String,
    pub enable: bool,
    pub node_pool_spec: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EcsNodeClass {
    pub name: String,
    pub node_class_spec: serde_json::Value,
}

/// One node pool upload; exactly one provider field is set
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebalanceNodePool {
    pub ec2_node_pool: Option<Ec2NodePool>,
    pub ecs_node_pool: Option<EcsNodePool>,
}

impl RebalanceNodePool {
    pub fn ec2(pool: Ec2NodePool) -> Self {
        Self {
            ec2_node_pool: Some(pool),
            ecs_node_pool: None,
        }
    }

    pub fn ecs(pool: EcsNodePool) -> Self {
        Self {
            ec2_node_pool: None,
            ecs_node_pool: Some(pool),
        }
    }

    /// Whether this body carries the pool shape `provider` expects
    pub fn matches(&self, provider: CloudProvider) -> bool {
        match provider {
            CloudProvider::Aws => self.ec2_node_pool.is_some(),
            CloudProvider::AlibabaCloud => self.ecs_node_pool.is_some(),
            CloudProvider::Gce | CloudProvider::Azure => false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebalanceNodePoolList {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub ec2_node_pools: Vec<Ec2NodePool>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub ecs_node_pools: Vec<EcsNodePool>,
}

/// One node class upload; exactly one provider field is set
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebalanceNodeClass {
    pub ec2_node_class: Option<Ec2NodeClass>,
    pub ecs_node_class: Option<EcsNodeClass>,
}

impl RebalanceNodeClass {
    pub fn ec2(class: Ec2NodeClass) -> Self {
        Self {
            ec2_node_class: Some(class),
            ecs_node_class: None,
        }
    }

    pub fn ecs(class: EcsNodeClass) -> Self {
        Self {
            ec2_node_class: None,
            ecs_node_class: Some(class),
        }
    }

    pub fn matches(&self, provider: CloudProvider) -> bool {
        match provider {
            CloudProvider::Aws => self.ec2_node_class.is_some(),
            CloudProvider::AlibabaCloud => self.ecs_node_class.is_some(),
            CloudProvider::Gce | CloudProvider::Azure => false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebalanceNodeClassList {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub ec2_node_classes: Vec<Ec2NodeClass>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub ecs_node_classes: Vec<EcsNodeClass>,
}

/// Per-workload rebalance policy set on the control plane
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebalanceWorkload {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    pub namespace: String,
    pub replicas: i32,
    pub rebalance_able: bool,
    #[serde(default)]
    pub spot_friendly: bool,
    #[serde(default)]
    pub min_non_spot_replicas: i32,
}

impl RebalanceWorkload {
    /// `kind/namespace/name` with the kind lower-cased, matching workload delta keys
    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.kind.to_lowercase(), self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadRebalanceConfiguration {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub workloads: Vec<RebalanceWorkload>,
}

impl WorkloadRebalanceConfiguration {
    /// Workloads keyed by `RebalanceWorkload::key`
    pub fn by_key(&self) -> BTreeMap<String, &RebalanceWorkload> {
        self.workloads.iter().map(|w| (w.key(), w)).collect()
    }
}

/// The control plane encodes empty lists as `null`
fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_success_codes() {
        for (code, ok) in [(0, true), (200, true), (500, false), (4001, false)] {
            let envelope = Envelope {
                code,
                ..Default::default()
            };
            assert_eq!(envelope.is_success(), ok, "code {code}");
        }
    }

    #[test]
    fn test_envelope_missing_fields() {
        let envelope: Envelope = serde_json::from_str("{}").unwrap();
        assert!(envelope.is_success());
        assert!(envelope.data.is_null());
    }

    #[test]
    fn test_register_request_wire_names() {
        let request = RegisterClusterRequest {
            agent_version: "v1.2.3".to_string(),
            cloud_provider: CloudProvider::AlibabaCloud,
            arch: vec!["amd64".to_string()],
            cluster_params: Some(ClusterParams {
                cluster_name: "prod".to_string(),
                account_id: "1234".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json["agentVersion"], "v1.2.3");
        assert_eq!(json["cloudProvider"], "alibabacloud");
        assert_eq!(json["gpuInstances"], serde_json::json!([]));
        assert!(json["eks"].is_null());
        assert_eq!(json["clusterParams"]["clusterName"], "prod");
        assert_eq!(json["clusterParams"]["accountId"], "1234");
    }

    #[test]
    fn test_rebalance_status_decode() {
        let status: RebalanceStatus = serde_json::from_value(serde_json::json!({
            "state": "LaunchingReplacements",
            "lastComponentsActiveTime": "2024-05-01T10:00:00Z",
            "message": "3 of 5",
        }))
        .unwrap();
        assert_eq!(status.state, RebalanceState::LaunchingReplacements);
        assert_eq!(status.message, "3 of 5");
        assert!(status.last_components_active_time.is_some());
    }

    #[test]
    fn test_rebalance_configuration_defaults() {
        let cfg: RebalanceConfiguration = serde_json::from_str(r#"{"enable":true}"#).unwrap();
        assert!(cfg.enable);
        assert!(!cfg.upload_config);
        assert!(!cfg.enable_diversity_instance_type);
    }

    #[test]
    fn test_node_pool_list_decode() {
        let list: RebalanceNodePoolList = serde_json::from_value(serde_json::json!({
            "ec2NodePools": null,
            "ecsNodePools": [{
                "name": "general",
                "enable": true,
                "nodePoolSpec": {"disruption": {"consolidationPolicy": "WhenEmpty"}},
            }],
        }))
        .unwrap();

        assert!(list.ec2_node_pools.is_empty());
        assert_eq!(list.ecs_node_pools.len(), 1);
        let pool = &list.ecs_node_pools[0];
        assert_eq!(pool.name, "general");
        assert_eq!(pool.node_pool_spec["disruption"]["consolidationPolicy"], "WhenEmpty");
    }

    #[test]
    fn test_node_pool_provider_match() {
        let pool = RebalanceNodePool::ecs(EcsNodePool {
            name: "general".to_string(),
            ..Default::default()
        });
        assert!(pool.matches(CloudProvider::AlibabaCloud));
        assert!(!pool.matches(CloudProvider::Aws));
        assert!(!pool.matches(CloudProvider::Gce));

        let json = serde_json::to_value(&pool).unwrap();
        assert!(json["ec2NodePool"].is_null());
        assert_eq!(json["ecsNodePool"]["name"], "general");
    }

    #[test]
    fn test_workload_rebalance_keys() {
        let cfg: WorkloadRebalanceConfiguration = serde_json::from_value(serde_json::json!({
            "workloads": [{
                "name": "web",
                "type": "Deployment",
                "namespace": "default",
                "replicas": 3,
                "rebalanceAble": true,
                "minNonSpotReplicas": 1,
            }],
        }))
        .unwrap();

        let by_key = cfg.by_key();
        let web = by_key["deployment/default/web"];
        assert!(web.rebalance_able);
        assert!(!web.spot_friendly);
        assert_eq!(web.min_non_spot_replicas, 1);
    }
}
