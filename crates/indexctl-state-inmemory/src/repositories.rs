use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use indexctl_core::{
    domain::collaborators::{
        CheckpointInfo, CheckpointStore, NodeId, StatusLocation, StatusStore, TargetAssignment,
        WorkerLivenessTable, WorkerNode,
    },
    BuildId, CoreError, TaskId, TaskStatus,
};

/// In-memory implementation of the StatusStore
///
/// Write failures can be injected to exercise the commit loop's rollback.
#[derive(Debug, Default)]
pub struct InMemoryStatusStore {
    live: Arc<RwLock<HashMap<BuildId, Vec<u8>>>>,
    stopped: Arc<RwLock<HashMap<BuildId, Vec<u8>>>>,
    writes: AtomicUsize,
    failures_left: AtomicUsize,
}

impl InMemoryStatusStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` writes fail
    pub fn fail_next_writes(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Number of successful writes so far
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn take_failure(&self) -> bool {
        self.failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl StatusStore for InMemoryStatusStore {
    async fn write(&self, build_id: &BuildId, bytes: Vec<u8>) -> Result<(), CoreError> {
        if self.take_failure() {
            warn!(build_id = %build_id, "Injected status write failure");
            return Err(CoreError::ExternalDependencyError(format!(
                "status store unavailable for job {}",
                build_id
            )));
        }
        let mut live = self.live.write().await;
        live.insert(build_id.clone(), bytes);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read(&self, build_id: &BuildId) -> Result<Option<Vec<u8>>, CoreError> {
        let live = self.live.read().await;
        Ok(live.get(build_id).cloned())
    }

    async fn move_to_stopped(&self, build_id: &BuildId) -> Result<(), CoreError> {
        let mut live = self.live.write().await;
        let doc = live.remove(build_id).ok_or_else(|| {
            CoreError::ExternalDependencyError(format!("no live status for job {}", build_id))
        })?;
        let mut stopped = self.stopped.write().await;
        stopped.insert(build_id.clone(), doc);
        debug!(build_id = %build_id, "Moved status to stopped marker");
        Ok(())
    }

    async fn read_stopped(&self, build_id: &BuildId) -> Result<Option<Vec<u8>>, CoreError> {
        let stopped = self.stopped.read().await;
        Ok(stopped.get(build_id).cloned())
    }

    async fn list(&self) -> Result<Vec<(BuildId, StatusLocation)>, CoreError> {
        let live = self.live.read().await;
        let stopped = self.stopped.read().await;

        let mut entries: Vec<(BuildId, StatusLocation)> = live
            .keys()
            .map(|id| (id.clone(), StatusLocation::Live))
            .chain(
                stopped
                    .keys()
                    .filter(|id| !live.contains_key(*id))
                    .map(|id| (id.clone(), StatusLocation::Stopped)),
            )
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }
}

#[derive(Debug, Default)]
struct ClusterCheckpoints {
    checkpoints: Vec<CheckpointInfo>,
    committed: Vec<u64>,
}

/// In-memory implementation of the CheckpointStore
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    clusters: Arc<RwLock<BTreeMap<String, ClusterCheckpoints>>>,
    next_checkpoint_id: AtomicUsize,
}

impl InMemoryCheckpointStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn mark_checkpoint(&self, cluster: &str, version: u64) -> Result<u64, CoreError> {
        let checkpoint_id = self.next_checkpoint_id.fetch_add(1, Ordering::SeqCst) as u64 + 1;
        let mut clusters = self.clusters.write().await;
        clusters
            .entry(cluster.to_string())
            .or_default()
            .checkpoints
            .push(CheckpointInfo {
                checkpoint_id,
                version,
                savepoint: false,
            });
        Ok(checkpoint_id)
    }

    async fn create_savepoint(&self, cluster: &str, checkpoint_id: u64) -> Result<(), CoreError> {
        self.set_savepoint(cluster, checkpoint_id, true).await
    }

    async fn remove_savepoint(&self, cluster: &str, checkpoint_id: u64) -> Result<(), CoreError> {
        self.set_savepoint(cluster, checkpoint_id, false).await
    }

    async fn list_checkpoint(&self, cluster: &str) -> Result<Vec<CheckpointInfo>, CoreError> {
        let clusters = self.clusters.read().await;
        Ok(clusters
            .get(cluster)
            .map(|c| c.checkpoints.clone())
            .unwrap_or_default())
    }

    async fn get_committed_versions(&self, cluster: &str) -> Result<Vec<u64>, CoreError> {
        let clusters = self.clusters.read().await;
        Ok(clusters
            .get(cluster)
            .map(|c| c.committed.clone())
            .unwrap_or_default())
    }

    async fn get_reserved_versions(&self, cluster: &str) -> Result<Vec<u64>, CoreError> {
        let clusters = self.clusters.read().await;
        let mut versions: Vec<u64> = clusters
            .get(cluster)
            .map(|c| {
                c.checkpoints
                    .iter()
                    .filter(|cp| cp.savepoint)
                    .map(|cp| cp.version)
                    .collect()
            })
            .unwrap_or_default();
        versions.sort_unstable();
        versions.dedup();
        Ok(versions)
    }

    async fn commit_version(&self, cluster: &str, version: u64) -> Result<(), CoreError> {
        let mut clusters = self.clusters.write().await;
        let entry = clusters.entry(cluster.to_string()).or_default();
        if entry.committed.last().map_or(false, |last| version <= *last) {
            return Err(CoreError::ExternalDependencyError(format!(
                "version {} of cluster {} is older than the last commit",
                version, cluster
            )));
        }
        entry.committed.push(version);
        Ok(())
    }
}

impl InMemoryCheckpointStore {
    async fn set_savepoint(&self, cluster: &str, checkpoint_id: u64, on: bool) -> Result<(), CoreError> {
        let mut clusters = self.clusters.write().await;
        let checkpoint = clusters
            .get_mut(cluster)
            .and_then(|c| c.checkpoints.iter_mut().find(|cp| cp.checkpoint_id == checkpoint_id))
            .ok_or_else(|| {
                CoreError::ExternalDependencyError(format!(
                    "checkpoint {} of cluster {} not found",
                    checkpoint_id, cluster
                ))
            })?;
        checkpoint.savepoint = on;
        Ok(())
    }
}

/// In-memory worker liveness table fed by heartbeats
///
/// Nodes whose last heartbeat is older than the timeout are marked dead on
/// the next status sync.
#[derive(Debug)]
pub struct InMemoryLivenessTable {
    nodes: DashMap<NodeId, WorkerNode>,
    targets: DashMap<TaskId, TargetAssignment>,
    heartbeat_timeout: Duration,
}

impl InMemoryLivenessTable {
    /// Create an empty table
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self {
            nodes: DashMap::new(),
            targets: DashMap::new(),
            heartbeat_timeout,
        }
    }

    /// Record a heartbeat of `node_id` working on `task_id`
    pub fn heartbeat(
        &self,
        node_id: NodeId,
        task_id: TaskId,
        reported_status: Option<TaskStatus>,
        at: DateTime<Utc>,
    ) {
        self.nodes.insert(
            node_id.clone(),
            WorkerNode {
                id: node_id,
                task_id,
                alive: true,
                reported_status,
                last_heartbeat: at,
            },
        );
    }

    /// Target last published for `task_id`
    pub fn target(&self, task_id: &TaskId) -> Option<TargetAssignment> {
        self.targets.get(task_id).map(|t| t.value().clone())
    }

    /// Number of known nodes, dead ones included
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

impl Default for InMemoryLivenessTable {
    fn default() -> Self {
        Self::new(Duration::seconds(30))
    }
}

impl WorkerLivenessTable for InMemoryLivenessTable {
    fn get_worker_nodes(&self, task_id: &TaskId) -> Vec<WorkerNode> {
        let mut nodes: Vec<WorkerNode> = self
            .nodes
            .iter()
            .filter(|n| &n.value().task_id == task_id)
            .map(|n| n.value().clone())
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    fn for_each_active_node(&self, f: &mut dyn FnMut(&WorkerNode)) {
        for node in self.nodes.iter().filter(|n| n.value().alive) {
            f(node.value());
        }
    }

    fn clear_all_nodes(&self) {
        self.nodes.clear();
        self.targets.clear();
    }

    fn sync_nodes_status(&self) -> Result<(), CoreError> {
        let now = Utc::now();
        for mut node in self.nodes.iter_mut() {
            if node.alive && now - node.last_heartbeat > self.heartbeat_timeout {
                debug!(node_id = %node.id, "Worker heartbeat timed out");
                node.alive = false;
            }
        }
        Ok(())
    }

    fn set_target(&self, target: TargetAssignment) {
        self.targets.insert(target.task_id.clone(), target);
    }
}
