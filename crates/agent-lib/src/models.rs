//! Core data models for the fleet agent
//!
//! Wire types (`NodeDelta`, `WorkloadDelta`) serialize in the control
//! plane's camelCase shape. Cluster-side views (`NodeInfo`, `PodInfo`,
//! `ObjectInfo`) are the reader-neutral form every component works on.

use crate::ledger::{Quantity, ResourceLedger};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

pub const INSTANCE_TYPE_LABEL: &str = "node.kubernetes.io/instance-type";
pub const ZONE_LABEL: &str = "topology.kubernetes.io/zone";
pub const AWS_ZONE_ID_LABEL: &str = "topology.k8s.aws/zone-id";
pub const KARPENTER_CAPACITY_TYPE_LABEL: &str = "karpenter.sh/capacity-type";
pub const KARPENTER_NODEPOOL_LABEL: &str = "karpenter.sh/nodepool";
pub const DO_NOT_DISRUPT_KEY: &str = "karpenter.sh/do-not-disrupt";
pub const EKS_CAPACITY_TYPE_LABEL: &str = "eks.amazonaws.com/capacityType";
pub const ALIBABA_SPOT_STRATEGY_LABEL: &str = "node.alibabacloud.com/spot-strategy";
pub const MANAGED_NODE_LABEL: &str = "node.cloudpilot.ai/managed";

/// Alibaba spot strategies that mean the instance is preemptible
const ALIBABA_SPOT_STRATEGIES: &[&str] = &["SpotWithPriceLimit", "SpotAsPriceGo"];

/// Kind of change a delta records
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Add,
    #[default]
    Update,
    Delete,
}

/// Spot or on-demand classification of a node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CapacityType {
    Spot,
    #[default]
    OnDemand,
}

/// Whether a node has been moved under fleet management
///
/// `Unknown` travels as JSON `null`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Rebalanced {
    #[default]
    Unknown,
    True,
    False,
}

impl From<bool> for Rebalanced {
    fn from(value: bool) -> Self {
        if value {
            Rebalanced::True
        } else {
            Rebalanced::False
        }
    }
}

impl Serialize for Rebalanced {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Rebalanced::Unknown => serializer.serialize_none(),
            Rebalanced::True => serializer.serialize_bool(true),
            Rebalanced::False => serializer.serialize_bool(false),
        }
    }
}

impl<'de> Deserialize<'de> for Rebalanced {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Option::<bool>::deserialize(deserializer)?
            .map(Rebalanced::from)
            .unwrap_or_default())
    }
}

/// Cloud the cluster runs on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloudProvider {
    #[default]
    Aws,
    Gce,
    Azure,
    #[serde(rename = "alibabacloud")]
    AlibabaCloud,
}

/// Workload controller kinds the agent knows how to read replicas from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
    DaemonSet,
    Unsupported,
}

/// (group, kind) -> variant
const WORKLOAD_KINDS: &[(&str, &str, WorkloadKind)] = &[
    ("apps", "Deployment", WorkloadKind::Deployment),
    ("apps", "StatefulSet", WorkloadKind::StatefulSet),
    ("apps", "DaemonSet", WorkloadKind::DaemonSet),
];

impl WorkloadKind {
    /// Resolve an `apiVersion`/`kind` pair
    pub fn resolve(api_version: &str, kind: &str) -> Self {
        let group = api_version
            .rsplit_once('/')
            .map(|(group, _)| group)
            .unwrap_or("");
        WORKLOAD_KINDS
            .iter()
            .find(|(g, k, _)| *g == group && *k == kind)
            .map(|(_, _, variant)| *variant)
            .unwrap_or(WorkloadKind::Unsupported)
    }

    /// Lower-case kind used in workload delta keys
    pub fn as_key(&self) -> &'static str {
        match self {
            WorkloadKind::Deployment => "deployment",
            WorkloadKind::StatefulSet => "statefulset",
            WorkloadKind::DaemonSet => "daemonset",
            WorkloadKind::Unsupported => "unsupported",
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_key())
    }
}

impl Serialize for WorkloadKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_key())
    }
}

impl<'de> Deserialize<'de> for WorkloadKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let kind = String::deserialize(deserializer)?;
        Ok(match kind.to_ascii_lowercase().as_str() {
            "deployment" => WorkloadKind::Deployment,
            "statefulset" => WorkloadKind::StatefulSet,
            "daemonset" => WorkloadKind::DaemonSet,
            _ => WorkloadKind::Unsupported,
        })
    }
}

/// One recorded node event awaiting export
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDelta {
    pub id: String,
    pub event: EventType,
    pub instance_type: String,
    pub capacity_type: CapacityType,
    pub ip_address: Vec<String>,
    pub zone: String,
    #[serde(rename = "AWSZoneID")]
    pub aws_zone_id: String,
    pub rebalanced: Rebalanced,
    pub status: String,
    pub message: String,
    pub status_last_transition_time: Option<DateTime<Utc>>,
    pub used_resources: ResourceLedger,
    pub request_resources: ResourceLedger,
    pub allocatable_resources: ResourceLedger,
    pub provisioned_resources: ResourceLedger,
    pub ready_pod_number: u32,
    pub not_ready_pod_number: u32,
    pub owner: String,
    /// Unix seconds, 0 when unset
    pub creation_timestamp: i64,
    /// Unix seconds, 0 when unset
    pub deletion_timestamp: i64,
}

impl NodeDelta {
    /// Build a delta from a node as an observer sees it
    ///
    /// Resource ledgers, IPs and pod counts are filled in here from the node
    /// object and refreshed again at export time while the node exists.
    pub fn from_node(node: &NodeInfo, event: EventType, provider: CloudProvider) -> Self {
        let label = |key: &str| node.labels.get(key).cloned().unwrap_or_default();

        let (status, message, status_last_transition_time) = match &node.ready_condition {
            Some(cond) => (
                match cond.status.as_str() {
                    "True" => "Ready".to_string(),
                    "False" => "NotReady".to_string(),
                    _ => "Unknown".to_string(),
                },
                cond.message.clone(),
                cond.last_transition_time,
            ),
            None => ("Unknown".to_string(), String::new(), None),
        };

        Self {
            id: node.name.clone(),
            event,
            instance_type: label(INSTANCE_TYPE_LABEL),
            capacity_type: node.capacity_type(provider),
            ip_address: node.internal_ips.clone(),
            zone: label(ZONE_LABEL),
            aws_zone_id: label(AWS_ZONE_ID_LABEL),
            rebalanced: node.rebalanced(),
            status,
            message,
            status_last_transition_time,
            used_resources: ResourceLedger::new(),
            request_resources: ResourceLedger::new(),
            allocatable_resources: node.allocatable.clone(),
            provisioned_resources: node.capacity.clone(),
            ready_pod_number: 0,
            not_ready_pod_number: 0,
            owner: label(KARPENTER_NODEPOOL_LABEL),
            creation_timestamp: node.creation_timestamp.map(|t| t.timestamp()).unwrap_or(0),
            deletion_timestamp: node.deletion_timestamp.map(|t| t.timestamp()).unwrap_or(0),
        }
    }
}

/// One recorded workload scaling event awaiting export
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadDelta {
    pub event: EventType,
    pub workload_type: WorkloadKind,
    pub namespace: String,
    pub replicas: i32,
}

impl WorkloadDelta {
    /// Buffer key: `kind/namespace/name`
    pub fn key(kind: WorkloadKind, namespace: &str, name: &str) -> String {
        format!("{}/{}/{}", kind.as_key(), namespace, name)
    }
}

/// Node `Ready` condition
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeCondition {
    pub status: String,
    pub message: String,
    pub last_transition_time: Option<DateTime<Utc>>,
}

/// Reader-neutral view of a node
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeInfo {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub internal_ips: Vec<String>,
    pub allocatable: ResourceLedger,
    pub capacity: ResourceLedger,
    pub ready_condition: Option<NodeCondition>,
    pub creation_timestamp: Option<DateTime<Utc>>,
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl NodeInfo {
    /// Capacity type from karpenter's label, then the provider's own label
    pub fn capacity_type(&self, provider: CloudProvider) -> CapacityType {
        if let Some(value) = self.labels.get(KARPENTER_CAPACITY_TYPE_LABEL) {
            return parse_capacity_type(value);
        }

        match provider {
            CloudProvider::Aws => self
                .labels
                .get(EKS_CAPACITY_TYPE_LABEL)
                .map(|v| parse_capacity_type(v))
                .unwrap_or_default(),
            CloudProvider::AlibabaCloud => match self.labels.get(ALIBABA_SPOT_STRATEGY_LABEL) {
                Some(strategy) if ALIBABA_SPOT_STRATEGIES.contains(&strategy.as_str()) => {
                    CapacityType::Spot
                }
                _ => CapacityType::OnDemand,
            },
            CloudProvider::Gce | CloudProvider::Azure => CapacityType::OnDemand,
        }
    }

    pub fn rebalanced(&self) -> Rebalanced {
        match self.labels.get(MANAGED_NODE_LABEL) {
            Some(value) => Rebalanced::from(value == "true"),
            None => Rebalanced::Unknown,
        }
    }

    /// Node opted out of disruption through label or annotation
    pub fn do_not_disrupt(&self) -> bool {
        self.annotations.get(DO_NOT_DISRUPT_KEY).map(String::as_str) == Some("true")
            || self.labels.get(DO_NOT_DISRUPT_KEY).map(String::as_str) == Some("true")
    }
}

fn parse_capacity_type(value: &str) -> CapacityType {
    match value.to_ascii_lowercase().as_str() {
        "spot" => CapacityType::Spot,
        _ => CapacityType::OnDemand,
    }
}

/// Pod lifecycle phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PodPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    pub fn parse(phase: &str) -> Self {
        match phase {
            "Pending" => PodPhase::Pending,
            "Running" => PodPhase::Running,
            "Succeeded" => PodPhase::Succeeded,
            "Failed" => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }
}

/// Reference from an object to its controller
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct OwnerReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
}

/// A pod condition as reported in status
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PodCondition {
    pub condition_type: String,
    pub status: String,
    pub reason: Option<String>,
}

/// Reader-neutral view of a pod
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PodInfo {
    pub name: String,
    pub namespace: String,
    pub node_name: Option<String>,
    pub phase: PodPhase,
    pub owner_references: Vec<OwnerReference>,
    pub annotations: BTreeMap<String, String>,
    pub conditions: Vec<PodCondition>,
    /// Requests of each container, in spec order
    pub container_requests: Vec<ResourceLedger>,
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl PodInfo {
    /// Ready condition true, or completed successfully
    pub fn is_ready(&self) -> bool {
        self.conditions
            .iter()
            .find(|c| c.condition_type == "Ready")
            .map(|c| c.reason.as_deref() == Some("PodCompleted") || c.status == "True")
            .unwrap_or(false)
    }

    pub fn is_running_or_pending(&self) -> bool {
        matches!(self.phase, PodPhase::Running | PodPhase::Pending)
    }

    pub fn is_terminating(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.phase, PodPhase::Succeeded | PodPhase::Failed)
    }

    /// Pods whose requests count toward allocation
    pub fn counts_toward_requests(&self) -> bool {
        self.is_running_or_pending() && !self.is_terminating()
    }

    fn owned_by(&self, kind: &str) -> bool {
        self.owner_references.iter().any(|o| o.kind == kind)
    }

    /// Pods that would move if their node were drained
    pub fn is_reschedulable(&self) -> bool {
        !self.owned_by("Node")
            && !self.owned_by("DaemonSet")
            && !self.is_terminal()
            && !self.is_terminating()
    }

    pub fn do_not_disrupt(&self) -> bool {
        self.annotations.get(DO_NOT_DISRUPT_KEY).map(String::as_str) == Some("true")
    }

    /// Sum of container requests
    pub fn requests(&self) -> ResourceLedger {
        ResourceLedger::sum(&self.container_requests)
    }
}

/// Generic object fetched while walking an ownership chain
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectInfo {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub owner_references: Vec<OwnerReference>,
}

impl ObjectInfo {
    /// `group/version, Kind=Kind`
    pub fn group_version_kind(&self) -> String {
        let (group, version) = self
            .api_version
            .rsplit_once('/')
            .unwrap_or(("", self.api_version.as_str()));
        format!("{group}/{version}, Kind={}", self.kind)
    }

    pub fn workload_kind(&self) -> WorkloadKind {
        WorkloadKind::resolve(&self.api_version, &self.kind)
    }
}

/// Replica fields of a workload controller
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkloadReplicas {
    /// `spec.replicas` (Deployment, StatefulSet)
    pub spec_replicas: Option<i32>,
    /// `status.desiredNumberScheduled` (DaemonSet)
    pub desired_number_scheduled: i32,
}

/// Point-in-time usage of one node
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeUsage {
    pub name: String,
    pub usage: ResourceLedger,
}

/// Point-in-time usage of one pod, per container
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PodUsage {
    pub namespace: String,
    pub name: String,
    pub containers: Vec<ResourceLedger>,
}

/// Sum cpu and memory from usage samples; both keys are always present
pub fn sum_cpu_memory<'a>(samples: impl IntoIterator<Item = &'a ResourceLedger>) -> ResourceLedger {
    let mut cpu = Quantity::ZERO;
    let mut memory = Quantity::ZERO;
    for sample in samples {
        cpu += sample.get("cpu").unwrap_or_default();
        memory += sample.get("memory").unwrap_or_default();
    }

    let mut total = ResourceLedger::new();
    total.insert("cpu", cpu);
    total.insert("memory", memory);
    total
}

impl PodUsage {
    pub fn total(&self) -> ResourceLedger {
        sum_cpu_memory(&self.containers)
    }
}
