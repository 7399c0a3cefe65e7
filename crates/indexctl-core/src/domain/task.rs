use crate::domain::flow::FlowId;
use crate::CoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// Value object: Task ID, `<flowId>.<taskName>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    /// Build the id of task `name` owned by `flow_id`
    pub fn new(flow_id: &FlowId, name: &str) -> Self {
        TaskId(format!("{}.{}", flow_id.0, name))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Task status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Bound to its flow but not materialized on any worker yet
    Pending,

    /// Materialized and running
    Running,

    /// Asked to suspend, workers have not confirmed
    Suspending,

    /// Suspended by its workers
    Suspended,

    /// Asked to stop, workers have not confirmed
    Stopping,

    /// Stopped
    Stopped,

    /// Completed its work
    Finished,
}

impl TaskStatus {
    /// Work may still be happening on a worker
    pub fn is_live(self) -> bool {
        matches!(
            self,
            TaskStatus::Running | TaskStatus::Suspending | TaskStatus::Stopping
        )
    }

    /// No further status change is possible
    pub fn is_final(self) -> bool {
        matches!(self, TaskStatus::Stopped | TaskStatus::Finished)
    }

    /// Lowercase name, as used in templates and dot output
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Suspending => "suspending",
            TaskStatus::Suspended => "suspended",
            TaskStatus::Stopping => "stopping",
            TaskStatus::Stopped => "stopped",
            TaskStatus::Finished => "finished",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work owned by exactly one flow and materialized onto workers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier
    pub id: TaskId,

    /// Owning flow
    pub flow_id: FlowId,

    /// Name, unique within the owning flow
    pub name: String,

    /// Registered task kind
    pub kind: String,

    /// Parameters handed to the workers
    pub params: BTreeMap<String, String>,

    /// Current status
    pub status: TaskStatus,

    /// Last status change
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a pending task bound to `flow_id`
    pub fn new(
        flow_id: &FlowId,
        name: &str,
        kind: &str,
        params: BTreeMap<String, String>,
    ) -> Self {
        Self {
            id: TaskId::new(flow_id, name),
            flow_id: flow_id.clone(),
            name: name.to_string(),
            kind: kind.to_string(),
            params,
            status: TaskStatus::Pending,
            updated_at: Utc::now(),
        }
    }

    fn set_status(&mut self, status: TaskStatus) {
        if self.status != status {
            self.status = status;
            self.updated_at = Utc::now();
        }
    }

    /// Hand the task to workers
    pub fn materialize(&mut self) {
        if self.status == TaskStatus::Pending {
            self.set_status(TaskStatus::Running);
        }
    }

    /// Ask the task to stop; a task never materialized stops at once
    pub fn request_stop(&mut self) {
        match self.status {
            TaskStatus::Pending => self.set_status(TaskStatus::Stopped),
            TaskStatus::Running | TaskStatus::Suspending | TaskStatus::Suspended => {
                self.set_status(TaskStatus::Stopping)
            }
            TaskStatus::Stopping | TaskStatus::Stopped | TaskStatus::Finished => {}
        }
    }

    /// Ask the task to suspend
    pub fn request_suspend(&mut self) {
        if self.status == TaskStatus::Running {
            self.set_status(TaskStatus::Suspending);
        }
    }

    /// Undo a suspend request
    pub fn resume(&mut self) {
        if matches!(self.status, TaskStatus::Suspending | TaskStatus::Suspended) {
            self.set_status(TaskStatus::Running);
        }
    }

    /// Apply a status reported by the workers running this task
    pub fn report(&mut self, status: TaskStatus) -> Result<(), CoreError> {
        if self.status.is_final() && status != self.status {
            return Err(CoreError::InvalidTransition(format!(
                "task {} is already {}, cannot report {}",
                self.id, self.status, status
            )));
        }
        if status == TaskStatus::Pending {
            return Err(CoreError::InvalidTransition(format!(
                "task {} cannot be reported back to pending",
                self.id
            )));
        }
        if self.status == TaskStatus::Pending {
            return Err(CoreError::InvalidTransition(format!(
                "task {} has not been materialized",
                self.id
            )));
        }
        self.set_status(status);
        Ok(())
    }
}

/// A kind of task the controller knows how to materialize
pub trait TaskKind: Send + Sync {
    /// The kind name templates refer to
    fn kind_name(&self) -> &str;

    /// Check task parameters at template instantiation and recovery time
    fn validate(&self, _params: &BTreeMap<String, String>) -> Result<(), CoreError> {
        Ok(())
    }

    /// Number of worker nodes the task wants
    fn required_workers(&self, params: &BTreeMap<String, String>) -> usize {
        params
            .get("partition_count")
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(1)
    }
}

/// Task kind defined only by its name and mandatory parameters
#[derive(Debug, Clone)]
pub struct GenericTaskKind {
    name: String,
    required_params: Vec<String>,
}

impl GenericTaskKind {
    /// Create a kind accepting any parameters
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            required_params: Vec::new(),
        }
    }

    /// Require `param` to be present on every task of this kind
    pub fn with_required_param(mut self, param: &str) -> Self {
        self.required_params.push(param.to_string());
        self
    }
}

impl TaskKind for GenericTaskKind {
    fn kind_name(&self) -> &str {
        &self.name
    }

    fn validate(&self, params: &BTreeMap<String, String>) -> Result<(), CoreError> {
        for required in &self.required_params {
            if !params.contains_key(required) {
                return Err(CoreError::TemplateError(format!(
                    "task kind {} requires parameter {}",
                    self.name, required
                )));
            }
        }
        Ok(())
    }
}

/// Explicit registry of task kinds, handed to every flow graph
#[derive(Clone, Default)]
pub struct TaskKindRegistry {
    kinds: HashMap<String, Arc<dyn TaskKind>>,
}

impl TaskKindRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a kind, replacing an earlier one with the same name
    pub fn register(&mut self, kind: Arc<dyn TaskKind>) {
        self.kinds.insert(kind.kind_name().to_string(), kind);
    }

    /// Builder-style register
    pub fn with_kind(mut self, kind: Arc<dyn TaskKind>) -> Self {
        self.register(kind);
        self
    }

    /// Look up a kind by name
    pub fn get(&self, name: &str) -> Result<Arc<dyn TaskKind>, CoreError> {
        self.kinds
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::TemplateError(format!("unknown task kind: {}", name)))
    }

    /// Registered kind names, sorted
    pub fn kind_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.kinds.keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for TaskKindRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskKindRegistry")
            .field("kinds", &self.kind_names())
            .finish()
    }
}
