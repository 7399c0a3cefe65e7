use crate::domain::flow::FlowId;
use crate::domain::flow_graph::FlowGraphSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

/// Tag of flows that must finish before the job counts as started
pub const TAG_STAGE_INIT: &str = "stage:init";

/// Tag of flows loaded when the job starts stopping
pub const TAG_STAGE_TEARDOWN: &str = "stage:teardown";

/// Tag of the flows of sub-task `name`
pub fn task_tag(name: &str) -> String {
    format!("task:{}", name)
}

/// Tag of the flows working on cluster `name`
pub fn cluster_tag(name: &str) -> String {
    format!("cluster:{}", name)
}

/// Value object: id of one build job
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BuildId(pub String);

impl BuildId {
    /// A fresh random id
    pub fn generate() -> Self {
        BuildId(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Job-level lifecycle step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GenerationStep {
    /// Initialization flows running
    Starting,
    /// Serving; flows come and go through commands
    Started,
    /// Flows stopping, teardown flows running
    Stopping,
    /// Done
    Stopped,
}

impl GenerationStep {
    /// Upper-case name
    pub fn as_str(self) -> &'static str {
        match self {
            GenerationStep::Starting => "STARTING",
            GenerationStep::Started => "STARTED",
            GenerationStep::Stopping => "STOPPING",
            GenerationStep::Stopped => "STOPPED",
        }
    }

    /// Position in the lifecycle, used as a gauge value
    pub fn ordinal(self) -> u8 {
        match self {
            GenerationStep::Starting => 0,
            GenerationStep::Started => 1,
            GenerationStep::Stopping => 2,
            GenerationStep::Stopped => 3,
        }
    }

    /// Commands that change flows are accepted
    pub fn is_active(self) -> bool {
        matches!(self, GenerationStep::Starting | GenerationStep::Started)
    }
}

impl fmt::Display for GenerationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job variant; each one customizes the lifecycle through a few hooks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Long-lived index build of a service
    ServiceBuild,
    /// Single batch run
    OneShotJob,
    /// Graph fully described by the job's own template
    CustomGraph,
    /// Container for operator-started sub-tasks
    GeneralTask,
}

impl JobKind {
    /// Template loaded by "start build"
    pub fn startup_template(self, config_path: &str) -> String {
        match self {
            JobKind::ServiceBuild => "service_build.yaml".to_string(),
            JobKind::OneShotJob => "one_shot_job.yaml".to_string(),
            JobKind::CustomGraph => config_path.to_string(),
            JobKind::GeneralTask => "general_task.yaml".to_string(),
        }
    }

    /// Template loaded once when the job enters STOPPING
    pub fn teardown_template(self) -> Option<&'static str> {
        match self {
            JobKind::ServiceBuild => Some("teardown.yaml"),
            _ => None,
        }
    }

    /// Template loaded by "roll back"
    pub fn rollback_template(self) -> Option<&'static str> {
        match self {
            JobKind::ServiceBuild | JobKind::OneShotJob => Some("rollback.yaml"),
            _ => None,
        }
    }

    /// Template loaded by "update configuration"
    pub fn update_config_template(self) -> Option<&'static str> {
        match self {
            JobKind::ServiceBuild => Some("update_config.yaml"),
            JobKind::GeneralTask => Some("update_config.yaml"),
            _ => None,
        }
    }

    /// Whether named sub-tasks may be started
    pub fn allows_sub_tasks(self) -> bool {
        matches!(self, JobKind::ServiceBuild | JobKind::GeneralTask)
    }

    /// Whether the job stops by itself once every flow is terminal
    pub fn completes_when_idle(self) -> bool {
        !matches!(self, JobKind::GeneralTask)
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobKind::ServiceBuild => "service_build",
            JobKind::OneShotJob => "one_shot_job",
            JobKind::CustomGraph => "custom_graph",
            JobKind::GeneralTask => "general_task",
        };
        f.write_str(name)
    }
}

/// First fatal flow error of a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FatalErrorRecord {
    /// The fatal flow
    pub flow_id: FlowId,
    /// Its error message
    pub message: String,
    /// When the controller observed it
    pub timestamp: DateTime<Utc>,
}

/// Where a rollback goes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackTarget {
    /// A committed output version
    Version(u64),
    /// A marked checkpoint
    Checkpoint(u64),
}

/// Everything about a job except its flow graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationMeta {
    /// Job id
    pub build_id: BuildId,

    /// Job variant
    pub kind: JobKind,

    /// Lifecycle step
    pub step: GenerationStep,

    /// Whether "start build" went through
    pub started: bool,

    /// Configuration the job was started with
    pub config_path: String,

    /// Root of the build output
    pub index_root: String,

    /// Parameters handed to every template
    pub params: BTreeMap<String, String>,

    /// Bumped by every configuration update
    pub config_revision: u64,

    /// Job creation
    pub created_at: DateTime<Utc>,

    /// Last step change
    pub step_changed_at: DateTime<Utc>,

    /// Entry into STOPPED
    pub stopped_at: Option<DateTime<Utc>>,

    /// Whole job suspended by command
    pub suspended: bool,

    /// Checkpoints marked through this job: cluster -> checkpoint -> version
    pub checkpoints: BTreeMap<String, BTreeMap<u64, u64>>,

    /// Savepoints created through this job, per cluster
    pub savepoints: BTreeMap<String, BTreeSet<u64>>,

    /// Last committed output version per cluster
    pub committed_versions: BTreeMap<String, u64>,

    /// Version each cluster was last rolled back to
    pub rollback_targets: BTreeMap<String, u64>,

    /// First fatal flow error
    pub fatal_error: Option<FatalErrorRecord>,
}

impl GenerationMeta {
    /// Metadata of a job that was not started yet
    pub fn new(
        build_id: BuildId,
        kind: JobKind,
        config_path: &str,
        index_root: &str,
        params: BTreeMap<String, String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            build_id,
            kind,
            step: GenerationStep::Starting,
            started: false,
            config_path: config_path.to_string(),
            index_root: index_root.to_string(),
            params,
            config_revision: 0,
            created_at: now,
            step_changed_at: now,
            stopped_at: None,
            suspended: false,
            checkpoints: BTreeMap::new(),
            savepoints: BTreeMap::new(),
            committed_versions: BTreeMap::new(),
            rollback_targets: BTreeMap::new(),
            fatal_error: None,
        }
    }
}

/// The persisted document of one job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationState {
    /// Job metadata
    pub meta: GenerationMeta,

    /// The flow graph
    pub flow_graph: FlowGraphSnapshot,
}
