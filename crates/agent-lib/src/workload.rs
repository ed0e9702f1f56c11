//! Per-workload resource rollups
//!
//! Built from scratch once per export cycle. Every owned pod is attributed
//! to its root owner; the table is keyed namespace uid -> group/version/kind
//! -> owner uid.

use crate::cluster::{resolve_root_owner, ClusterReader};
use crate::error::{ExportError, WorkloadError};
use crate::ledger::ResourceLedger;
use crate::models::{ObjectInfo, WorkloadKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, warn};

/// Resources attributed to one root owner
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadResource {
    /// Empty when workload identity uploading is disabled
    pub name: String,
    pub namespace: String,
    pub replicas: i32,
    pub ready_replicas: i32,
    #[serde(rename = "usedResource")]
    pub used_resources: ResourceLedger,
    #[serde(rename = "requestResource")]
    pub request_resources: ResourceLedger,
}

/// owner uid -> resources
pub type WorkloadsResources = BTreeMap<String, WorkloadResource>;
/// group/version/kind -> owners
pub type KindsWorkloadsResources = BTreeMap<String, WorkloadsResources>;
/// namespace uid -> kinds
pub type NamespacesKindsWorkloadsResources = BTreeMap<String, KindsWorkloadsResources>;

/// Output of one aggregation pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkloadAggregation {
    pub workloads: NamespacesKindsWorkloadsResources,
    /// Requests of every Running/Pending pod, owned or not
    pub cluster_requests: ResourceLedger,
}

/// Replica count of a root owner
///
/// Deployment and StatefulSet report `spec.replicas` (1 when unset),
/// DaemonSet reports its desired scheduled count.
pub async fn workload_replicas<R>(reader: &R, owner: &ObjectInfo) -> Result<i32, WorkloadError>
where
    R: ClusterReader + ?Sized,
{
    match owner.workload_kind() {
        kind @ (WorkloadKind::Deployment | WorkloadKind::StatefulSet) => {
            let replicas = reader
                .get_workload_replicas(kind, &owner.namespace, &owner.name)
                .await?;
            Ok(replicas.spec_replicas.unwrap_or(1))
        }
        WorkloadKind::DaemonSet => {
            let replicas = reader
                .get_workload_replicas(WorkloadKind::DaemonSet, &owner.namespace, &owner.name)
                .await?;
            Ok(replicas.desired_number_scheduled)
        }
        WorkloadKind::Unsupported => Err(WorkloadError::UnsupportedKind(
            owner.group_version_kind(),
        )),
    }
}

/// Rolls pods up into their root owners
pub struct WorkloadAggregator<'a, R: ?Sized> {
    reader: &'a R,
    anonymize: bool,
}

impl<'a, R> WorkloadAggregator<'a, R>
where
    R: ClusterReader + ?Sized,
{
    pub fn new(reader: &'a R) -> Self {
        Self {
            reader,
            anonymize: false,
        }
    }

    /// Leave workload name and namespace empty in the output
    pub fn anonymize(mut self, anonymize: bool) -> Self {
        self.anonymize = anonymize;
        self
    }

    /// Run one aggregation pass over every pod in the cluster
    ///
    /// Pod-list and namespace-lookup failures abort the pass. Owner
    /// resolution and replica failures only affect the pod or owner
    /// concerned. Missing usage metrics leave used ledgers empty.
    pub async fn aggregate(&self) -> Result<WorkloadAggregation, ExportError> {
        let pods = self
            .reader
            .list_pods(None)
            .await
            .map_err(ExportError::PodList)?;

        let pod_usage: HashMap<(String, String), ResourceLedger> =
            match self.reader.list_pod_usage().await {
                Ok(usage) => usage
                    .into_iter()
                    .map(|u| {
                        let total = u.total();
                        ((u.namespace, u.name), total)
                    })
                    .collect(),
                Err(e) => {
                    warn!(error = %e, "Failed to read pod metrics, workload usage will be empty");
                    HashMap::new()
                }
            };

        let mut output = WorkloadAggregation::default();
        let mut namespace_uids: HashMap<String, String> = HashMap::new();
        let mut replicas_seen: HashSet<(String, String, String)> = HashSet::new();

        for pod in &pods {
            let requests = if pod.counts_toward_requests() {
                let requests = pod.requests();
                output.cluster_requests += &requests;
                requests
            } else {
                ResourceLedger::new()
            };

            // Unowned pods only count toward cluster totals
            let Some(first_owner) = pod.owner_references.first() else {
                continue;
            };

            let namespace_uid = match namespace_uids.get(&pod.namespace) {
                Some(uid) => uid.clone(),
                None => {
                    let uid = self
                        .reader
                        .get_namespace_uid(&pod.namespace)
                        .await
                        .map_err(|source| ExportError::NamespaceLookup {
                            namespace: pod.namespace.clone(),
                            source,
                        })?;
                    namespace_uids.insert(pod.namespace.clone(), uid.clone());
                    uid
                }
            };

            let owner = match resolve_root_owner(self.reader, &pod.namespace, first_owner).await {
                Ok(owner) => owner,
                Err(e) => {
                    warn!(
                        pod = %pod.name,
                        namespace = %pod.namespace,
                        error = %e,
                        "Skipping pod with unresolvable owner"
                    );
                    continue;
                }
            };

            let gvk = owner.group_version_kind();
            let first_seen =
                replicas_seen.insert((namespace_uid.clone(), gvk.clone(), owner.uid.clone()));
            let replicas = if first_seen {
                match workload_replicas(self.reader, &owner).await {
                    Ok(replicas) => Some(replicas),
                    Err(e) => {
                        warn!(
                            owner = %owner.name,
                            namespace = %owner.namespace,
                            error = %e,
                            "Failed to read workload replicas"
                        );
                        None
                    }
                }
            } else {
                None
            };

            let entry = output
                .workloads
                .entry(namespace_uid)
                .or_default()
                .entry(gvk)
                .or_default()
                .entry(owner.uid.clone())
                .or_default();

            if !self.anonymize {
                entry.name = owner.name.clone();
                entry.namespace = owner.namespace.clone();
            }
            if pod.is_ready() {
                entry.ready_replicas += 1;
            }
            if let Some(replicas) = replicas {
                entry.replicas = replicas;
            }
            entry.request_resources += &requests;
            if let Some(used) = pod_usage.get(&(pod.namespace.clone(), pod.name.clone())) {
                entry.used_resources += used;
            }
        }

        debug!(
            pods = pods.len(),
            namespaces = output.workloads.len(),
            "Workload aggregation complete"
        );

        Ok(output)
    }
}
