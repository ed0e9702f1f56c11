//! Pending change events awaiting export
//!
//! Observers record node and workload events here as they happen; the
//! exporter drains both maps once per cycle. The two maps are guarded
//! independently. Whenever both are needed they are taken node first, then
//! workload.

use crate::models::{NodeDelta, WorkloadDelta};
use crate::observability::StructuredLogger;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::{Mutex, MutexGuard};

/// Node deltas keyed by node name
pub type NodeDeltas = BTreeMap<String, NodeDelta>;

/// Workload deltas keyed by `kind/namespace/name`
pub type WorkloadDeltas = BTreeMap<String, WorkloadDelta>;

/// A detached copy of both delta maps
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingDeltas {
    pub node_deltas: NodeDeltas,
    pub workload_deltas: WorkloadDeltas,
}

impl PendingDeltas {
    pub fn is_empty(&self) -> bool {
        self.node_deltas.is_empty() && self.workload_deltas.is_empty()
    }
}

/// Both delta maps, locked node first
pub struct DeltaGuard<'a> {
    pub nodes: MutexGuard<'a, NodeDeltas>,
    pub workloads: MutexGuard<'a, WorkloadDeltas>,
}

impl DeltaGuard<'_> {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.workloads.is_empty()
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.workloads.clear();
    }
}

/// Process-wide buffer of pending node and workload deltas
///
/// Constructed once and shared by reference (usually `Arc`) between every
/// producer and the single exporter.
#[derive(Debug, Default)]
pub struct DeltaStore {
    nodes: Mutex<NodeDeltas>,
    workloads: Mutex<WorkloadDeltas>,
    logger: Option<StructuredLogger>,
}

impl DeltaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit a `delta_recorded` event for every put
    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Record a node event, replacing any pending event for the node
    pub async fn put_node(&self, name: impl Into<String>, delta: NodeDelta) {
        let name = name.into();
        if let Some(logger) = &self.logger {
            logger.log_delta_recorded("node", &name, delta.event);
        }
        self.nodes.lock().await.insert(name, delta);
    }

    /// Record a workload event under `kind/namespace/name`
    pub async fn put_workload(&self, name: &str, delta: WorkloadDelta) {
        let key = WorkloadDelta::key(delta.workload_type, &delta.namespace, name);
        if let Some(logger) = &self.logger {
            logger.log_delta_recorded("workload", &key, delta.event);
        }
        self.workloads.lock().await.insert(key, delta);
    }

    /// Copy entries whose key is not already pending
    ///
    /// Existing entries are never overwritten, so merging the same source
    /// twice is the same as merging it once.
    pub async fn merge_if_absent(&self, other: &PendingDeltas) {
        let mut guard = self.lock().await;
        merge_missing(&mut guard.nodes, &other.node_deltas);
        merge_missing(&mut guard.workloads, &other.workload_deltas);
    }

    /// Workload-only variant of `merge_if_absent`
    pub async fn merge_workloads_if_absent(&self, other: &PendingDeltas) {
        let mut workloads = self.workloads.lock().await;
        merge_missing(&mut workloads, &other.workload_deltas);
    }

    /// Number of pending (node, workload) deltas
    pub async fn pending_counts(&self) -> (usize, usize) {
        let guard = self.lock().await;
        (guard.nodes.len(), guard.workloads.len())
    }

    /// Copy of everything pending
    pub async fn pending(&self) -> PendingDeltas {
        let guard = self.lock().await;
        PendingDeltas {
            node_deltas: guard.nodes.clone(),
            workload_deltas: guard.workloads.clone(),
        }
    }

    /// Take both locks in the fixed order
    pub async fn lock(&self) -> DeltaGuard<'_> {
        let nodes = self.nodes.lock().await;
        let workloads = self.workloads.lock().await;
        DeltaGuard { nodes, workloads }
    }
}

fn merge_missing<V: Clone>(dest: &mut BTreeMap<String, V>, src: &BTreeMap<String, V>) {
    for (key, value) in src {
        if !dest.contains_key(key) {
            dest.insert(key.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EventType, WorkloadKind};
    use std::sync::Arc;
    use std::time::Duration;

    fn node_delta(id: &str, event: EventType) -> NodeDelta {
        NodeDelta {
            id: id.to_string(),
            event,
            ..Default::default()
        }
    }

    fn workload_delta(namespace: &str, replicas: i32) -> WorkloadDelta {
        WorkloadDelta {
            event: EventType::Update,
            workload_type: WorkloadKind::Deployment,
            namespace: namespace.to_string(),
            replicas,
        }
    }

    #[tokio::test]
    async fn test_put_overwrites() {
        let store = DeltaStore::new();
        store.put_node("node-a", node_delta("node-a", EventType::Add)).await;
        store.put_node("node-a", node_delta("node-a", EventType::Delete)).await;

        let pending = store.pending().await;
        assert_eq!(pending.node_deltas.len(), 1);
        assert_eq!(pending.node_deltas["node-a"].event, EventType::Delete);
    }

    #[tokio::test]
    async fn test_workload_key() {
        let store = DeltaStore::new();
        store.put_workload("web", workload_delta("default", 3)).await;

        let pending = store.pending().await;
        assert!(pending.workload_deltas.contains_key("deployment/default/web"));
    }

    #[tokio::test]
    async fn test_merge_keeps_first_writer() {
        let store = DeltaStore::new();
        store.put_node("node-a", node_delta("node-a", EventType::Update)).await;

        let mut other = PendingDeltas::default();
        other
            .node_deltas
            .insert("node-a".to_string(), node_delta("node-a", EventType::Add));
        other
            .node_deltas
            .insert("node-b".to_string(), node_delta("node-b", EventType::Add));

        store.merge_if_absent(&other).await;

        let pending = store.pending().await;
        assert_eq!(pending.node_deltas["node-a"].event, EventType::Update);
        assert_eq!(pending.node_deltas["node-b"].event, EventType::Add);
    }

    #[tokio::test]
    async fn test_merge_is_idempotent() {
        let mut other = PendingDeltas::default();
        other
            .node_deltas
            .insert("node-a".to_string(), node_delta("node-a", EventType::Add));
        other.workload_deltas.insert(
            "deployment/default/web".to_string(),
            workload_delta("default", 2),
        );

        let once = DeltaStore::new();
        once.merge_if_absent(&other).await;

        let twice = DeltaStore::new();
        twice.merge_if_absent(&other).await;
        twice.merge_if_absent(&other).await;

        assert_eq!(once.pending().await, twice.pending().await);
        assert_eq!(twice.pending_counts().await, (1, 1));
    }

    #[tokio::test]
    async fn test_merge_workloads_only() {
        let mut other = PendingDeltas::default();
        other
            .node_deltas
            .insert("node-a".to_string(), node_delta("node-a", EventType::Add));
        other.workload_deltas.insert(
            "deployment/default/web".to_string(),
            workload_delta("default", 2),
        );

        let store = DeltaStore::new();
        store.merge_workloads_if_absent(&other).await;
        assert_eq!(store.pending_counts().await, (0, 1));
    }

    #[derive(Clone, Default)]
    struct LogBuffer(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_put_emits_delta_recorded() {
        let buffer = LogBuffer::default();
        let writer = buffer.clone();
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let store = DeltaStore::new().with_logger(StructuredLogger::new("c-1"));
        store.put_node("node-a", node_delta("node-a", EventType::Add)).await;
        store.put_workload("web", workload_delta("default", 2)).await;

        let output = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
        let recorded: Vec<serde_json::Value> = output
            .lines()
            .map(|line| serde_json::from_str::<serde_json::Value>(line).unwrap())
            .filter(|line| line["fields"]["event"] == "delta_recorded")
            .collect();

        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[0]["fields"]["kind"], "node");
        assert_eq!(recorded[0]["fields"]["key"], "node-a");
        assert_eq!(recorded[1]["fields"]["kind"], "workload");
        assert_eq!(recorded[1]["fields"]["key"], "deployment/default/web");
        assert_eq!(recorded[1]["fields"]["cluster_id"], "c-1");
    }

    #[tokio::test]
    async fn test_concurrent_producers() {
        let store = Arc::new(DeltaStore::new());
        let mut handles = Vec::new();

        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let name = format!("node-{i}");
                store.put_node(name.clone(), node_delta(&name, EventType::Add)).await;
                store
                    .put_workload(&format!("app-{i}"), workload_delta("default", i))
                    .await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.pending_counts().await, (16, 16));
    }

    #[tokio::test]
    async fn test_producers_wait_while_locked() {
        let store = Arc::new(DeltaStore::new());
        let mut guard = store.lock().await;

        let producer = {
            let store = store.clone();
            tokio::spawn(async move {
                store.put_node("node-a", node_delta("node-a", EventType::Add)).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());

        guard.clear();
        drop(guard);
        producer.await.unwrap();

        // The event recorded during the locked window survives the clear
        assert_eq!(store.pending_counts().await, (1, 0));
    }
}
