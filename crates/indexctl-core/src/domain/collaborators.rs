//! Interfaces of the subsystems the controller only calls through

use crate::domain::generation::BuildId;
use crate::domain::task::{TaskId, TaskStatus};
use crate::CoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Value object: worker node identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A worker process as seen by the liveness table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerNode {
    /// Node identity
    pub id: NodeId,

    /// Task the node works on
    pub task_id: TaskId,

    /// Heartbeat still arriving
    pub alive: bool,

    /// Last task status the node reported, if any
    pub reported_status: Option<TaskStatus>,

    /// Time of the last heartbeat
    pub last_heartbeat: DateTime<Utc>,
}

/// What the controller wants the workers of one task to do
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetAssignment {
    /// Task the target applies to
    pub task_id: TaskId,

    /// Task status the workers should converge to
    pub target_status: TaskStatus,

    /// Nodes expected to carry the task
    pub nodes: Vec<NodeId>,
}

/// Worker liveness table shared by the heartbeat service and the controller
pub trait WorkerLivenessTable: Send + Sync {
    /// Nodes currently attached to `task_id`
    fn get_worker_nodes(&self, task_id: &TaskId) -> Vec<WorkerNode>;

    /// Visit every alive node
    fn for_each_active_node(&self, f: &mut dyn FnMut(&WorkerNode));

    /// Forget every node
    fn clear_all_nodes(&self);

    /// Pull fresh node statuses from the heartbeat source
    fn sync_nodes_status(&self) -> Result<(), CoreError>;

    /// Publish the target for one task
    fn set_target(&self, target: TargetAssignment);
}

/// One checkpoint of a cluster's build output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointInfo {
    /// Checkpoint id, unique per cluster
    pub checkpoint_id: u64,

    /// Output version the checkpoint refers to
    pub version: u64,

    /// Protected from garbage collection
    pub savepoint: bool,
}

/// Checkpoint and version store for build output, keyed by cluster name
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Record a checkpoint of `version`, returning its id
    async fn mark_checkpoint(&self, cluster: &str, version: u64) -> Result<u64, CoreError>;

    /// Protect a checkpoint from garbage collection
    async fn create_savepoint(&self, cluster: &str, checkpoint_id: u64) -> Result<(), CoreError>;

    /// Drop the protection of a checkpoint
    async fn remove_savepoint(&self, cluster: &str, checkpoint_id: u64) -> Result<(), CoreError>;

    /// All checkpoints of a cluster, oldest first
    async fn list_checkpoint(&self, cluster: &str) -> Result<Vec<CheckpointInfo>, CoreError>;

    /// Committed versions of a cluster, oldest first
    async fn get_committed_versions(&self, cluster: &str) -> Result<Vec<u64>, CoreError>;

    /// Versions reserved by savepoints
    async fn get_reserved_versions(&self, cluster: &str) -> Result<Vec<u64>, CoreError>;

    /// Publish a new output version
    async fn commit_version(&self, cluster: &str, version: u64) -> Result<(), CoreError>;
}

/// Where a stored status document lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusLocation {
    /// The live document of a running job
    Live,
    /// The marker left behind by a stopped job
    Stopped,
}

/// Durable small-object store holding one status document per job
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Replace the live document
    async fn write(&self, build_id: &BuildId, bytes: Vec<u8>) -> Result<(), CoreError>;

    /// Read the live document
    async fn read(&self, build_id: &BuildId) -> Result<Option<Vec<u8>>, CoreError>;

    /// Move the live document to the stopped marker
    async fn move_to_stopped(&self, build_id: &BuildId) -> Result<(), CoreError>;

    /// Read the stopped marker
    async fn read_stopped(&self, build_id: &BuildId) -> Result<Option<Vec<u8>>, CoreError>;

    /// Every stored job and where its document lives
    async fn list(&self) -> Result<Vec<(BuildId, StatusLocation)>, CoreError>;
}

/// Demand of one task, as handed to the resource planner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDemand {
    /// The task
    pub task_id: TaskId,

    /// Its kind
    pub kind: String,

    /// Its status
    pub status: TaskStatus,

    /// Workers the task wants
    pub required_workers: usize,

    /// Alive workers it currently has
    pub assigned_workers: usize,
}

/// Scheduling plan produced by the resource planner
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcePlan {
    /// Extra workers requested per task
    pub requests: BTreeMap<TaskId, usize>,
}

/// Turns the current task demand into a cluster scheduling plan
#[async_trait]
pub trait ResourcePlanner: Send + Sync {
    /// Compute a plan for one job
    async fn plan(&self, build_id: &BuildId, demand: &[TaskDemand])
        -> Result<ResourcePlan, CoreError>;
}

/// Planner requesting the missing workers of every running task
#[derive(Debug, Default, Clone)]
pub struct ShortfallResourcePlanner;

#[async_trait]
impl ResourcePlanner for ShortfallResourcePlanner {
    async fn plan(
        &self,
        _build_id: &BuildId,
        demand: &[TaskDemand],
    ) -> Result<ResourcePlan, CoreError> {
        let requests = demand
            .iter()
            .filter(|d| d.status == TaskStatus::Running && d.assigned_workers < d.required_workers)
            .map(|d| (d.task_id.clone(), d.required_workers - d.assigned_workers))
            .collect();
        Ok(ResourcePlan { requests })
    }
}

/// Receives the gauges published after every tick
pub trait MetricsSink: Send + Sync {
    /// Set a gauge
    fn gauge(&self, name: &str, value: f64, labels: &[(&str, String)]);

    /// Increment a counter
    fn increment(&self, name: &str, labels: &[(&str, String)]);
}

/// Sink that drops everything
#[derive(Debug, Default, Clone)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn gauge(&self, _name: &str, _value: f64, _labels: &[(&str, String)]) {}

    fn increment(&self, _name: &str, _labels: &[(&str, String)]) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shortfall_planner() {
        let demand = vec![
            TaskDemand {
                task_id: TaskId("1.build".to_string()),
                kind: "build".to_string(),
                status: TaskStatus::Running,
                required_workers: 3,
                assigned_workers: 1,
            },
            TaskDemand {
                task_id: TaskId("2.build".to_string()),
                kind: "build".to_string(),
                status: TaskStatus::Stopping,
                required_workers: 3,
                assigned_workers: 0,
            },
        ];
        let plan = ShortfallResourcePlanner
            .plan(&BuildId("app".to_string()), &demand)
            .await
            .unwrap();
        assert_eq!(plan.requests.len(), 1);
        assert_eq!(plan.requests[&TaskId("1.build".to_string())], 2);
    }
}
