use crate::{
    application::commit_loop::Transactional,
    config::ControllerConfig,
    domain::collaborators::{
        CheckpointStore, MetricsSink, NodeId, ResourcePlan, ResourcePlanner, StatusStore,
        TargetAssignment, TaskDemand, WorkerLivenessTable,
    },
    domain::events::{DomainEvent, DomainEventHandler, FatalFlowDetected, GenerationStepChanged},
    domain::flow::{Flow, FlowId, FlowStatus},
    domain::flow_graph::{FlowGraph, GraphContext},
    domain::generation::{
        cluster_tag, task_tag, BuildId, FatalErrorRecord, GenerationMeta, GenerationState,
        GenerationStep, JobKind, RollbackTarget, TAG_STAGE_INIT, TAG_STAGE_TEARDOWN,
    },
    domain::task::{TaskId, TaskStatus},
    CoreError,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Collaborators of one job
#[derive(Clone)]
pub struct GenerationServices {
    /// Controller configuration
    pub config: ControllerConfig,

    /// Task kinds and template resolution for the flow graph
    pub graph: GraphContext,

    /// Durable status documents
    pub status_store: Arc<dyn StatusStore>,

    /// Checkpoints and versions of the build output
    pub checkpoint_store: Arc<dyn CheckpointStore>,

    /// Worker liveness table of this job
    pub liveness: Arc<dyn WorkerLivenessTable>,

    /// Cluster scheduling plans
    pub planner: Arc<dyn ResourcePlanner>,

    /// Gauge sink
    pub metrics: Arc<dyn MetricsSink>,

    /// Receives domain events after every commit
    pub event_handler: Arc<dyn DomainEventHandler>,
}

impl fmt::Debug for GenerationServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationServices")
            .field("config", &self.config)
            .field("graph", &self.graph)
            .finish()
    }
}

/// Worker assignments derived after a tick, never persisted
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerPlan {
    /// Target per materialized task
    pub assignments: BTreeMap<TaskId, TargetAssignment>,

    /// Alive nodes whose heartbeat is older than the slow threshold
    pub slow_nodes: Vec<NodeId>,

    /// Last plan of the resource planner
    pub resource_plan: ResourcePlan,

    /// When the plan was computed
    pub computed_at: Option<DateTime<Utc>>,
}

/// Persisted lifecycle of one build job and the flow graph it owns
pub struct GenerationStateMachine {
    meta: GenerationMeta,
    graph: FlowGraph,
    services: GenerationServices,
    cleaned_up: bool,
    events: Vec<Box<dyn DomainEvent>>,
}

impl fmt::Debug for GenerationStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationStateMachine")
            .field("build_id", &self.meta.build_id)
            .field("kind", &self.meta.kind)
            .field("step", &self.meta.step)
            .field("graph", &self.graph)
            .finish()
    }
}

fn accepts_report(current: TaskStatus, reported: TaskStatus) -> bool {
    matches!(
        (current, reported),
        (TaskStatus::Running, TaskStatus::Finished)
            | (TaskStatus::Suspending, TaskStatus::Suspended)
            | (TaskStatus::Suspending, TaskStatus::Finished)
            | (TaskStatus::Stopping, TaskStatus::Stopped)
            | (TaskStatus::Stopping, TaskStatus::Finished)
    )
}

impl GenerationStateMachine {
    /// A job that has not received "start build" yet
    pub fn new(
        build_id: BuildId,
        kind: JobKind,
        config_path: &str,
        index_root: &str,
        params: BTreeMap<String, String>,
        services: GenerationServices,
    ) -> Self {
        let graph = FlowGraph::new(services.graph.clone());
        Self {
            meta: GenerationMeta::new(build_id, kind, config_path, index_root, params),
            graph,
            services,
            cleaned_up: false,
            events: Vec::new(),
        }
    }

    /// Rebuild a job from its persisted document
    ///
    /// All or nothing: any parse or integrity failure yields `RecoveryError`.
    pub fn recover(document: &[u8], services: GenerationServices) -> Result<Self, CoreError> {
        let state: GenerationState = serde_json::from_slice(document)
            .map_err(|e| CoreError::RecoveryError(format!("malformed status document: {}", e)))?;
        Self::from_state(state, services)
    }

    fn from_state(state: GenerationState, services: GenerationServices) -> Result<Self, CoreError> {
        if state.meta.build_id.0.is_empty() {
            return Err(CoreError::RecoveryError("status document without build id".to_string()));
        }
        let graph = FlowGraph::restore(state.flow_graph, services.graph.clone()).map_err(|e| match e {
            CoreError::RecoveryError(_) => e,
            other => CoreError::RecoveryError(other.to_string()),
        })?;
        Ok(Self {
            meta: state.meta,
            graph,
            services,
            cleaned_up: false,
            events: Vec::new(),
        })
    }

    /// The persisted document
    pub fn to_state(&self) -> GenerationState {
        GenerationState {
            meta: self.meta.clone(),
            flow_graph: self.graph.snapshot(),
        }
    }

    /// Job id
    pub fn build_id(&self) -> &BuildId {
        &self.meta.build_id
    }

    /// Job variant
    pub fn kind(&self) -> JobKind {
        self.meta.kind
    }

    /// Lifecycle step
    pub fn step(&self) -> GenerationStep {
        self.meta.step
    }

    /// Job metadata
    pub fn meta(&self) -> &GenerationMeta {
        &self.meta
    }

    /// The flow graph
    pub fn graph(&self) -> &FlowGraph {
        &self.graph
    }

    /// First fatal flow error, if any
    pub fn fatal_error(&self) -> Option<&FatalErrorRecord> {
        self.meta.fatal_error.as_ref()
    }

    /// Whether the STOPPED cleanup already ran
    pub fn is_cleaned_up(&self) -> bool {
        self.cleaned_up
    }

    /// Mark the STOPPED cleanup as done
    pub fn mark_cleaned_up(&mut self) {
        self.cleaned_up = true;
    }

    fn set_step(&mut self, next: GenerationStep) {
        let from = self.meta.step;
        if from == next {
            return;
        }
        let now = Utc::now();
        self.meta.step = next;
        self.meta.step_changed_at = now;
        if next == GenerationStep::Stopped {
            self.meta.stopped_at = Some(now);
        }
        info!(build_id = %self.meta.build_id, from = %from, to = %next, "Generation step changed");
        self.events.push(Box::new(GenerationStepChanged {
            build_id: self.meta.build_id.clone(),
            from,
            to: next,
            timestamp: now,
        }));
    }

    fn ensure_started(&self) -> Result<(), CoreError> {
        if !self.meta.started {
            return Err(CoreError::ValidationError(format!(
                "job {} has not been started",
                self.meta.build_id
            )));
        }
        Ok(())
    }

    fn ensure_active(&self) -> Result<(), CoreError> {
        self.ensure_started()?;
        if !self.meta.step.is_active() {
            return Err(CoreError::ValidationError(format!(
                "job {} is {}, command not accepted",
                self.meta.build_id, self.meta.step
            )));
        }
        Ok(())
    }

    fn template_params(&self, extra: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut params = self.meta.params.clone();
        params.insert("build_id".to_string(), self.meta.build_id.0.clone());
        params.insert("index_root".to_string(), self.meta.index_root.clone());
        params.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        params
    }

    fn load_tagged(
        &mut self,
        graph_name: &str,
        template: &str,
        params: &BTreeMap<String, String>,
        tag: &str,
    ) -> Result<Vec<FlowId>, CoreError> {
        let ids = self.graph.load_sub_graph(graph_name, template, params)?;
        for id in &ids {
            self.graph.add_tag(id, tag)?;
        }
        Ok(ids)
    }

    fn flows_matching(&self, tag: &str, pred: impl Fn(&Flow) -> bool) -> Vec<FlowId> {
        self.graph
            .get_flow_id_by_tag(tag)
            .into_iter()
            .filter(|id| self.graph.get_flow(id).map(&pred).unwrap_or(false))
            .collect()
    }

    /// Load the startup graph and enter STARTING
    pub fn start_build(&mut self) -> Result<(), CoreError> {
        if self.meta.started {
            return Err(CoreError::ValidationError(format!(
                "job {} already started",
                self.meta.build_id
            )));
        }
        let template = self.meta.kind.startup_template(&self.meta.config_path);
        let params = self.template_params(&BTreeMap::new());
        let ids = self.load_tagged("startup", &template, &params, TAG_STAGE_INIT)?;

        self.meta.started = true;
        self.meta.step = GenerationStep::Starting;
        self.meta.step_changed_at = Utc::now();
        info!(build_id = %self.meta.build_id, kind = %self.meta.kind, flows = ids.len(), "Build started");
        Ok(())
    }

    fn enter_stopping(&mut self) -> Result<(), CoreError> {
        self.set_step(GenerationStep::Stopping);
        let stopped = self.graph.stop_all();
        debug!(build_id = %self.meta.build_id, stopped, "Stopping flows");
        if let Some(template) = self.meta.kind.teardown_template() {
            let params = self.template_params(&BTreeMap::new());
            self.load_tagged("teardown", template, &params, TAG_STAGE_TEARDOWN)?;
        }
        Ok(())
    }

    /// Stop every flow and enter STOPPING
    pub fn stop_build(&mut self) -> Result<(), CoreError> {
        self.ensure_active()?;
        self.enter_stopping()
    }

    /// Suspend every flow that is waiting or running
    pub fn suspend_build(&mut self) -> Result<(), CoreError> {
        self.ensure_active()?;
        if self.meta.suspended {
            return Ok(());
        }
        let ids: Vec<FlowId> = self
            .graph
            .flows()
            .filter(|f| matches!(f.status(), FlowStatus::Init | FlowStatus::Running))
            .map(|f| f.id.clone())
            .collect();
        for id in &ids {
            self.graph.suspend_flow(id)?;
        }
        self.meta.suspended = true;
        info!(build_id = %self.meta.build_id, flows = ids.len(), "Build suspended");
        Ok(())
    }

    /// Resume every suspended flow
    pub fn resume_build(&mut self) -> Result<(), CoreError> {
        self.ensure_active()?;
        if !self.meta.suspended {
            return Ok(());
        }
        let ids: Vec<FlowId> = self
            .graph
            .flows()
            .filter(|f| matches!(f.status(), FlowStatus::Suspending | FlowStatus::Suspended))
            .map(|f| f.id.clone())
            .collect();
        for id in &ids {
            self.graph.resume_flow(id)?;
        }
        self.meta.suspended = false;
        info!(build_id = %self.meta.build_id, flows = ids.len(), "Build resumed");
        Ok(())
    }

    /// Suspend one flow
    pub fn suspend_flow(&mut self, flow_id: &FlowId) -> Result<(), CoreError> {
        self.ensure_active()?;
        self.graph.suspend_flow(flow_id)
    }

    /// Resume one flow
    pub fn resume_flow(&mut self, flow_id: &FlowId) -> Result<(), CoreError> {
        self.ensure_active()?;
        self.graph.resume_flow(flow_id)
    }

    /// Stop one flow
    pub fn stop_flow(&mut self, flow_id: &FlowId) -> Result<(), CoreError> {
        self.ensure_started()?;
        self.graph.stop_flow(flow_id)
    }

    /// Start the named sub-task from `template`
    pub fn start_task(
        &mut self,
        name: &str,
        template: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<Vec<FlowId>, CoreError> {
        self.ensure_active()?;
        if !self.meta.kind.allows_sub_tasks() {
            return Err(CoreError::ValidationError(format!(
                "{} jobs do not accept sub-tasks",
                self.meta.kind
            )));
        }
        let tag = task_tag(name);
        if !self.flows_matching(&tag, |f| !f.status().is_terminal()).is_empty() {
            return Err(CoreError::ValidationError(format!(
                "sub-task {} is already running",
                name
            )));
        }

        let mut extra = params.clone();
        extra.insert("task_name".to_string(), name.to_string());
        let params = self.template_params(&extra);
        let ids = self.load_tagged("", template, &params, &tag)?;
        if ids.is_empty() {
            return Err(CoreError::ValidationError(format!(
                "template {} of sub-task {} has no flows",
                template, name
            )));
        }
        info!(build_id = %self.meta.build_id, task = name, flows = ids.len(), "Sub-task started");
        Ok(ids)
    }

    /// Stop every live flow of the named sub-task
    pub fn stop_task(&mut self, name: &str) -> Result<(), CoreError> {
        self.ensure_active()?;
        let ids = self.flows_matching(&task_tag(name), |f| {
            !f.status().is_terminal() && f.status() != FlowStatus::Stopping
        });
        if ids.is_empty() {
            return Err(CoreError::ValidationError(format!("sub-task {} is not running", name)));
        }
        for id in &ids {
            self.graph.stop_flow(id)?;
        }
        info!(build_id = %self.meta.build_id, task = name, "Sub-task stopping");
        Ok(())
    }

    /// Load a named sub-graph, once per non-empty name
    pub fn call_graph(
        &mut self,
        graph_name: &str,
        template: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<Vec<FlowId>, CoreError> {
        self.ensure_active()?;
        let params = self.template_params(params);
        self.graph.load_sub_graph(graph_name, template, &params)
    }

    /// Roll one cluster back to a committed version or a checkpoint
    pub async fn rollback(&mut self, cluster: &str, target: RollbackTarget) -> Result<(), CoreError> {
        self.ensure_active()?;
        let template = self.meta.kind.rollback_template().ok_or_else(|| {
            CoreError::ValidationError(format!("{} jobs cannot roll back", self.meta.kind))
        })?;

        let store = self.services.checkpoint_store.clone();
        let version = match target {
            RollbackTarget::Version(version) => {
                let committed = store.get_committed_versions(cluster).await?;
                if !committed.contains(&version) {
                    return Err(CoreError::ValidationError(format!(
                        "version {} of cluster {} was never committed",
                        version, cluster
                    )));
                }
                version
            }
            RollbackTarget::Checkpoint(checkpoint_id) => store
                .list_checkpoint(cluster)
                .await?
                .into_iter()
                .find(|c| c.checkpoint_id == checkpoint_id)
                .map(|c| c.version)
                .ok_or_else(|| {
                    CoreError::ValidationError(format!(
                        "checkpoint {} of cluster {} does not exist",
                        checkpoint_id, cluster
                    ))
                })?,
        };

        let tag = cluster_tag(cluster);
        for id in self.flows_matching(&tag, |f| {
            !f.status().is_terminal() && f.status() != FlowStatus::Stopping
        }) {
            self.graph.stop_flow(&id)?;
        }

        let mut extra = BTreeMap::new();
        extra.insert("cluster".to_string(), cluster.to_string());
        extra.insert("version".to_string(), version.to_string());
        let params = self.template_params(&extra);
        self.load_tagged("", template, &params, &tag)?;
        self.meta.rollback_targets.insert(cluster.to_string(), version);
        info!(build_id = %self.meta.build_id, cluster, version, "Rolling back");
        Ok(())
    }

    /// Mark a checkpoint of `version`, returning its id
    pub async fn mark_checkpoint(&mut self, cluster: &str, version: u64) -> Result<u64, CoreError> {
        self.ensure_active()?;
        let checkpoint_id = self
            .services
            .checkpoint_store
            .mark_checkpoint(cluster, version)
            .await?;
        self.meta
            .checkpoints
            .entry(cluster.to_string())
            .or_default()
            .insert(checkpoint_id, version);
        Ok(checkpoint_id)
    }

    /// Protect a checkpoint from garbage collection
    pub async fn create_savepoint(&mut self, cluster: &str, checkpoint_id: u64) -> Result<(), CoreError> {
        self.ensure_active()?;
        let store = self.services.checkpoint_store.clone();
        let exists = store
            .list_checkpoint(cluster)
            .await?
            .iter()
            .any(|c| c.checkpoint_id == checkpoint_id);
        if !exists {
            return Err(CoreError::ValidationError(format!(
                "checkpoint {} of cluster {} does not exist",
                checkpoint_id, cluster
            )));
        }
        store.create_savepoint(cluster, checkpoint_id).await?;
        self.meta
            .savepoints
            .entry(cluster.to_string())
            .or_default()
            .insert(checkpoint_id);
        Ok(())
    }

    /// Drop a savepoint created by this job
    pub async fn remove_savepoint(&mut self, cluster: &str, checkpoint_id: u64) -> Result<(), CoreError> {
        self.ensure_started()?;
        let known = self
            .meta
            .savepoints
            .get(cluster)
            .map(|s| s.contains(&checkpoint_id))
            .unwrap_or(false);
        if !known {
            return Err(CoreError::ValidationError(format!(
                "no savepoint {} for cluster {}",
                checkpoint_id, cluster
            )));
        }
        self.services
            .checkpoint_store
            .remove_savepoint(cluster, checkpoint_id)
            .await?;
        if let Some(savepoints) = self.meta.savepoints.get_mut(cluster) {
            savepoints.remove(&checkpoint_id);
            if savepoints.is_empty() {
                self.meta.savepoints.remove(cluster);
            }
        }
        Ok(())
    }

    /// Publish a new output version of a cluster
    pub async fn commit_version(&mut self, cluster: &str, version: u64) -> Result<(), CoreError> {
        self.ensure_active()?;
        if let Some(last) = self.meta.committed_versions.get(cluster) {
            if version <= *last {
                return Err(CoreError::ValidationError(format!(
                    "version {} of cluster {} is not newer than {}",
                    version, cluster, last
                )));
            }
        }
        self.services
            .checkpoint_store
            .commit_version(cluster, version)
            .await?;
        self.meta
            .committed_versions
            .insert(cluster.to_string(), version);
        Ok(())
    }

    /// Switch to a new configuration without restarting the job
    pub fn update_config(
        &mut self,
        config_path: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<(), CoreError> {
        self.ensure_active()?;
        let template = self.meta.kind.update_config_template().ok_or_else(|| {
            CoreError::ValidationError(format!(
                "{} jobs do not support configuration updates",
                self.meta.kind
            ))
        })?;

        self.meta.config_revision += 1;
        self.meta.config_path = config_path.to_string();
        self.meta
            .params
            .extend(params.iter().map(|(k, v)| (k.clone(), v.clone())));
        let graph_name = format!("update-config-{}", self.meta.config_revision);
        let params = self.template_params(&BTreeMap::new());
        self.graph.load_sub_graph(&graph_name, template, &params)?;
        info!(build_id = %self.meta.build_id, revision = self.meta.config_revision, "Configuration updated");
        Ok(())
    }

    /// Apply a task status reported out of band
    pub fn report_task_status(&mut self, task_id: &TaskId, status: TaskStatus) -> Result<(), CoreError> {
        self.ensure_started()?;
        self.graph.report_task_status(task_id, status)
    }

    /// Record an error raised by a flow's tasks
    pub fn report_flow_error(
        &mut self,
        flow_id: &FlowId,
        message: &str,
        is_fatal: bool,
    ) -> Result<(), CoreError> {
        self.ensure_started()?;
        self.graph.set_flow_error(flow_id, message, is_fatal)?;
        self.observe_fatal()
    }

    /// Set an operator property on one flow
    pub fn set_flow_property(
        &mut self,
        flow_id: &FlowId,
        key: &str,
        value: &str,
    ) -> Result<(), CoreError> {
        self.ensure_started()?;
        if key.is_empty() {
            return Err(CoreError::ValidationError("property key is empty".to_string()));
        }
        self.graph.set_flow_property(flow_id, key, value)
    }

    /// Operator removal of a flow, fatal ones included
    pub fn remove_flow(&mut self, flow_id: &FlowId, clear_tasks: bool) -> Result<(), CoreError> {
        self.ensure_started()?;
        self.graph.remove_flow(flow_id, clear_tasks).map(|_| ())
    }

    fn observe_fatal(&mut self) -> Result<(), CoreError> {
        if self.meta.fatal_error.is_some() {
            return Ok(());
        }
        let Some(flow) = self.graph.flows().find(|f| f.is_fatal()) else {
            return Ok(());
        };

        let record = FatalErrorRecord {
            flow_id: flow.id.clone(),
            message: flow
                .last_error()
                .map(|e| e.message.clone())
                .unwrap_or_default(),
            timestamp: Utc::now(),
        };
        error!(
            build_id = %self.meta.build_id,
            flow_id = %record.flow_id,
            message = %record.message,
            "Fatal flow error"
        );
        self.events.push(Box::new(FatalFlowDetected {
            build_id: self.meta.build_id.clone(),
            flow_id: record.flow_id.clone(),
            message: record.message.clone(),
            timestamp: record.timestamp,
        }));
        self.meta.fatal_error = Some(record);

        if self.services.config.auto_stop_on_fatal && self.meta.step.is_active() {
            warn!(build_id = %self.meta.build_id, "Stopping job after fatal flow error");
            self.enter_stopping()?;
        }
        Ok(())
    }

    fn absorb_worker_reports(&mut self) {
        let liveness = self.services.liveness.clone();
        let updates: Vec<(TaskId, TaskStatus)> = self
            .graph
            .tasks()
            .filter_map(|task| {
                let reports: Vec<TaskStatus> = liveness
                    .get_worker_nodes(&task.id)
                    .into_iter()
                    .filter_map(|n| n.reported_status)
                    .collect();
                let first = *reports.first()?;
                if !reports.iter().all(|s| *s == first) {
                    return None;
                }
                accepts_report(task.status, first).then(|| (task.id.clone(), first))
            })
            .collect();

        for (task_id, status) in updates {
            if let Err(e) = self.graph.report_task_status(&task_id, status) {
                warn!(task_id = %task_id, error = %e, "Ignoring worker report");
            }
        }
    }

    fn advance_step(&mut self) -> Result<(), CoreError> {
        loop {
            let before = self.meta.step;
            match before {
                GenerationStep::Starting if self.graph.all_terminal(Some(TAG_STAGE_INIT)) => {
                    self.set_step(GenerationStep::Started)
                }
                GenerationStep::Started
                    if self.meta.kind.completes_when_idle() && self.graph.all_terminal(None) =>
                {
                    self.enter_stopping()?
                }
                GenerationStep::Stopping if self.graph.all_terminal(None) => {
                    self.set_step(GenerationStep::Stopped)
                }
                _ => {}
            }
            if self.meta.step == before {
                return Ok(());
            }
        }
    }

    /// The periodic mutation: absorb worker reports, step the graph,
    /// observe fatal flows, advance the job step and clean up old flows
    pub fn tick(&mut self) -> Result<(), CoreError> {
        if !self.meta.started || self.meta.step == GenerationStep::Stopped {
            return Ok(());
        }

        self.absorb_worker_reports();
        for (flow_id, e) in self.graph.step_run() {
            debug!(build_id = %self.meta.build_id, flow_id = %flow_id, error = %e, "Flow did not advance");
        }
        self.observe_fatal()?;
        self.advance_step()?;

        let removed = self
            .graph
            .cleanup(Utc::now(), self.services.config.flow_retention());
        if !removed.is_empty() {
            debug!(build_id = %self.meta.build_id, removed = removed.len(), "Cleaned up flows");
        }
        Ok(())
    }

    /// One-time work once STOPPED: move the live document to the stopped marker
    pub async fn cleanup_stopped(&mut self) -> Result<(), CoreError> {
        if self.cleaned_up {
            return Ok(());
        }
        self.services
            .status_store
            .move_to_stopped(&self.meta.build_id)
            .await?;
        self.services.liveness.clear_all_nodes();
        for status in FlowStatus::ALL {
            self.services.metrics.gauge(
                "indexctl_flows",
                0.0,
                &[
                    ("build_id", self.meta.build_id.0.clone()),
                    ("status", status.as_str().to_string()),
                ],
            );
        }
        self.cleaned_up = true;
        info!(build_id = %self.meta.build_id, "Job stopped, status moved to stopped marker");
        Ok(())
    }

    /// Derive worker targets, slow nodes and the resource plan, and publish gauges
    ///
    /// Never fails: collaborator errors are logged and the affected part of
    /// the plan is left empty.
    pub async fn refresh_worker_plan(&self) -> WorkerPlan {
        let liveness = &self.services.liveness;
        if let Err(e) = liveness.sync_nodes_status() {
            warn!(build_id = %self.meta.build_id, error = %e, "Worker status sync failed");
        }

        let mut assignments = BTreeMap::new();
        let mut demand = Vec::new();
        for task in self.graph.tasks() {
            let target_status = match task.status {
                TaskStatus::Pending => continue,
                TaskStatus::Running => TaskStatus::Running,
                TaskStatus::Suspending | TaskStatus::Suspended => TaskStatus::Suspended,
                TaskStatus::Stopping | TaskStatus::Stopped => TaskStatus::Stopped,
                TaskStatus::Finished => TaskStatus::Finished,
            };
            let alive: Vec<NodeId> = liveness
                .get_worker_nodes(&task.id)
                .into_iter()
                .filter(|n| n.alive)
                .map(|n| n.id)
                .collect();

            if target_status == TaskStatus::Running {
                let required_workers = self
                    .services
                    .graph
                    .registry
                    .get(&task.kind)
                    .map(|k| k.required_workers(&task.params))
                    .unwrap_or(1);
                demand.push(TaskDemand {
                    task_id: task.id.clone(),
                    kind: task.kind.clone(),
                    status: task.status,
                    required_workers,
                    assigned_workers: alive.len(),
                });
            }

            let target = TargetAssignment {
                task_id: task.id.clone(),
                target_status,
                nodes: if target_status == TaskStatus::Running {
                    alive
                } else {
                    Vec::new()
                },
            };
            liveness.set_target(target.clone());
            assignments.insert(task.id.clone(), target);
        }

        let now = Utc::now();
        let threshold = self.services.config.slow_worker_threshold();
        let mut slow_nodes = Vec::new();
        liveness.for_each_active_node(&mut |node| {
            if now - node.last_heartbeat > threshold {
                slow_nodes.push(node.id.clone());
            }
        });
        if !slow_nodes.is_empty() {
            warn!(build_id = %self.meta.build_id, slow = slow_nodes.len(), "Slow workers detected");
        }

        let resource_plan = match self.services.planner.plan(&self.meta.build_id, &demand).await {
            Ok(plan) => plan,
            Err(e) => {
                warn!(build_id = %self.meta.build_id, error = %e, "Resource planning failed");
                ResourcePlan::default()
            }
        };

        self.publish_metrics(slow_nodes.len());

        WorkerPlan {
            assignments,
            slow_nodes,
            resource_plan,
            computed_at: Some(now),
        }
    }

    fn publish_metrics(&self, slow_workers: usize) {
        let metrics = &self.services.metrics;
        let build_id = self.meta.build_id.0.clone();
        let counts = self.graph.status_counts();
        for status in FlowStatus::ALL {
            let count = counts.get(status.as_str()).copied().unwrap_or(0);
            metrics.gauge(
                "indexctl_flows",
                count as f64,
                &[("build_id", build_id.clone()), ("status", status.as_str().to_string())],
            );
        }
        metrics.gauge(
            "indexctl_slow_workers",
            slow_workers as f64,
            &[("build_id", build_id.clone())],
        );
        metrics.gauge(
            "indexctl_generation_step",
            f64::from(self.meta.step.ordinal()),
            &[("build_id", build_id)],
        );
    }

    /// Hand pending domain events to the event handler
    pub fn dispatch_events(&mut self) {
        let mut events = std::mem::take(&mut self.events);
        events.extend(self.graph.take_events());
        for event in &events {
            self.services.event_handler.handle_event(event.as_ref());
        }
    }

    /// Count a failed write of this job's status document
    pub fn count_persist_failure(&self) {
        self.services.metrics.increment(
            "indexctl_persist_failures",
            &[("build_id", self.meta.build_id.to_string())],
        );
    }
}

impl Transactional for GenerationStateMachine {
    fn serialize_state(&self) -> Result<Vec<u8>, CoreError> {
        Ok(serde_json::to_vec(&self.to_state())?)
    }

    fn restore_state(&mut self, bytes: &[u8]) -> Result<(), CoreError> {
        let state: GenerationState = serde_json::from_slice(bytes)?;
        let graph = FlowGraph::restore(state.flow_graph, self.services.graph.clone())?;
        self.meta = state.meta;
        self.graph = graph;
        self.events.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::collaborators::WorkerNode;
    use crate::test_support::{services_with, test_services, TestWorld};
    use pretty_assertions::assert_eq;

    fn machine(kind: JobKind, world: &TestWorld) -> GenerationStateMachine {
        let mut params = BTreeMap::new();
        params.insert("cluster".to_string(), "c1".to_string());
        GenerationStateMachine::new(
            BuildId("app-1".to_string()),
            kind,
            "custom.yaml",
            "/index/app-1",
            params,
            world.services(),
        )
    }

    fn finish_running_tasks(m: &mut GenerationStateMachine) {
        let running: Vec<TaskId> = m
            .graph()
            .tasks()
            .filter(|t| t.status == TaskStatus::Running)
            .map(|t| t.id.clone())
            .collect();
        for id in running {
            m.report_task_status(&id, TaskStatus::Finished).unwrap();
        }
    }

    #[test]
    fn test_commands_rejected_before_start() {
        let world = TestWorld::new();
        let mut m = machine(JobKind::ServiceBuild, &world);
        assert!(matches!(m.stop_build(), Err(CoreError::ValidationError(_))));
        assert!(matches!(m.suspend_build(), Err(CoreError::ValidationError(_))));
        m.start_build().unwrap();
        assert!(matches!(m.start_build(), Err(CoreError::ValidationError(_))));
    }

    #[test]
    fn test_lifecycle_with_teardown() {
        let world = TestWorld::new();
        let mut m = machine(JobKind::ServiceBuild, &world);
        m.start_build().unwrap();
        assert_eq!(m.step(), GenerationStep::Starting);
        assert_eq!(m.graph().get_flow_id_by_tag(TAG_STAGE_INIT).len(), 2);

        m.tick().unwrap();
        assert_eq!(m.step(), GenerationStep::Starting);

        finish_running_tasks(&mut m);
        m.tick().unwrap();
        finish_running_tasks(&mut m);
        m.tick().unwrap();
        // init flows done; the job idles into STOPPING and loads its teardown
        assert_eq!(m.step(), GenerationStep::Stopping);
        assert_eq!(m.graph().get_flow_id_by_tag(TAG_STAGE_TEARDOWN).len(), 1);

        m.tick().unwrap();
        finish_running_tasks(&mut m);
        m.tick().unwrap();
        assert_eq!(m.step(), GenerationStep::Stopped);
        assert!(m.meta().stopped_at.is_some());
    }

    #[test]
    fn test_general_task_waits_for_stop() {
        let world = TestWorld::new();
        let mut m = machine(JobKind::GeneralTask, &world);
        m.start_build().unwrap();
        m.tick().unwrap();
        assert_eq!(m.step(), GenerationStep::Started);
        m.tick().unwrap();
        assert_eq!(m.step(), GenerationStep::Started);

        let ids = m.start_task("reindex", "sub_task.yaml", &BTreeMap::new()).unwrap();
        assert_eq!(m.graph().get_flow_id_by_tag("task:reindex"), ids);
        assert!(matches!(
            m.start_task("reindex", "sub_task.yaml", &BTreeMap::new()),
            Err(CoreError::ValidationError(_))
        ));

        m.stop_task("reindex").unwrap();
        assert!(matches!(m.stop_task("reindex"), Err(CoreError::ValidationError(_))));

        m.stop_build().unwrap();
        m.tick().unwrap();
        assert_eq!(m.step(), GenerationStep::Stopped);
        assert!(matches!(m.stop_build(), Err(CoreError::ValidationError(_))));
    }

    #[test]
    fn test_sub_tasks_not_allowed_for_one_shot_jobs() {
        let world = TestWorld::new();
        let mut m = machine(JobKind::OneShotJob, &world);
        m.start_build().unwrap();
        assert!(matches!(
            m.start_task("x", "sub_task.yaml", &BTreeMap::new()),
            Err(CoreError::ValidationError(_))
        ));
    }

    #[test]
    fn test_suspend_and_resume_build() {
        let world = TestWorld::new();
        let mut m = machine(JobKind::ServiceBuild, &world);
        m.start_build().unwrap();
        m.tick().unwrap();

        m.suspend_build().unwrap();
        assert!(m.meta().suspended);
        assert!(m
            .graph()
            .flows()
            .all(|f| f.status() == FlowStatus::Suspending || f.status() == FlowStatus::Suspended));

        m.resume_build().unwrap();
        assert!(!m.meta().suspended);
        assert!(m
            .graph()
            .flows()
            .all(|f| matches!(f.status(), FlowStatus::Running | FlowStatus::Init)));
    }

    #[test]
    fn test_worker_reports_are_absorbed_in_tick() {
        let world = TestWorld::new();
        let mut m = machine(JobKind::ServiceBuild, &world);
        m.start_build().unwrap();
        m.tick().unwrap();

        let running: Vec<TaskId> = m
            .graph()
            .tasks()
            .filter(|t| t.status == TaskStatus::Running)
            .map(|t| t.id.clone())
            .collect();
        assert!(!running.is_empty());
        for (i, task_id) in running.iter().enumerate() {
            world.liveness.upsert(WorkerNode {
                id: NodeId(format!("node-{}", i)),
                task_id: task_id.clone(),
                alive: true,
                reported_status: Some(TaskStatus::Finished),
                last_heartbeat: Utc::now(),
            });
        }

        m.tick().unwrap();
        for task_id in &running {
            assert_eq!(m.graph().get_task(task_id).unwrap().status, TaskStatus::Finished);
        }
    }

    #[test]
    fn test_fatal_flow_recorded_once_and_auto_stop() {
        let world = TestWorld::new();
        let mut config = ControllerConfig::default();
        config.auto_stop_on_fatal = true;
        let services = services_with(&world, config);
        let mut m = GenerationStateMachine::new(
            BuildId("app-2".to_string()),
            JobKind::ServiceBuild,
            "",
            "/index/app-2",
            BTreeMap::from([("cluster".to_string(), "c1".to_string())]),
            services,
        );
        m.start_build().unwrap();
        m.tick().unwrap();

        let flow_id = m
            .graph()
            .flows()
            .find(|f| f.status() == FlowStatus::Running)
            .map(|f| f.id.clone())
            .unwrap();
        m.report_flow_error(&flow_id, "index corrupted", true).unwrap();

        let fatal = m.fatal_error().cloned().unwrap();
        assert_eq!(fatal.flow_id, flow_id);
        assert_eq!(fatal.message, "index corrupted");
        assert_eq!(m.step(), GenerationStep::Stopping);

        m.tick().unwrap();
        assert_eq!(m.fatal_error(), Some(&fatal));
    }

    #[tokio::test]
    async fn test_checkpoint_commands() {
        let world = TestWorld::new();
        let mut m = machine(JobKind::ServiceBuild, &world);
        m.start_build().unwrap();

        m.commit_version("c1", 10).await.unwrap();
        assert!(matches!(
            m.commit_version("c1", 10).await,
            Err(CoreError::ValidationError(_))
        ));

        let checkpoint = m.mark_checkpoint("c1", 10).await.unwrap();
        m.create_savepoint("c1", checkpoint).await.unwrap();
        assert!(m.meta().savepoints["c1"].contains(&checkpoint));
        assert!(matches!(
            m.create_savepoint("c1", 999).await,
            Err(CoreError::ValidationError(_))
        ));

        m.remove_savepoint("c1", checkpoint).await.unwrap();
        assert!(m.meta().savepoints.get("c1").is_none());
        assert!(matches!(
            m.remove_savepoint("c1", checkpoint).await,
            Err(CoreError::ValidationError(_))
        ));
    }

    #[tokio::test]
    async fn test_rollback_to_version() {
        let world = TestWorld::new();
        let mut m = machine(JobKind::ServiceBuild, &world);
        m.start_build().unwrap();
        m.tick().unwrap();

        assert!(matches!(
            m.rollback("c1", RollbackTarget::Version(3)).await,
            Err(CoreError::ValidationError(_))
        ));

        m.commit_version("c1", 3).await.unwrap();
        let before = m.graph().len();
        m.rollback("c1", RollbackTarget::Version(3)).await.unwrap();
        assert_eq!(m.meta().rollback_targets["c1"], 3);
        assert_eq!(m.graph().len(), before + 1);

        let cluster_flows = m.graph().get_flow_id_by_tag("cluster:c1");
        let stopping = cluster_flows
            .iter()
            .filter(|id| m.graph().get_flow(id).unwrap().status() == FlowStatus::Stopping)
            .count();
        assert_eq!(stopping, 1);
    }

    #[test]
    fn test_update_config_loads_template_per_revision() {
        let world = TestWorld::new();
        let mut m = machine(JobKind::ServiceBuild, &world);
        m.start_build().unwrap();
        let before = m.graph().len();

        let mut params = BTreeMap::new();
        params.insert("replicas".to_string(), "3".to_string());
        m.update_config("v2.yaml", &params).unwrap();
        m.update_config("v3.yaml", &params).unwrap();

        assert_eq!(m.meta().config_revision, 2);
        assert_eq!(m.meta().config_path, "v3.yaml");
        assert_eq!(m.graph().len(), before + 2);

        let mut custom = machine(JobKind::CustomGraph, &world);
        custom.start_build().unwrap();
        assert!(matches!(
            custom.update_config("v2.yaml", &params),
            Err(CoreError::ValidationError(_))
        ));
    }

    #[test]
    fn test_recover_round_trip() {
        let world = TestWorld::new();
        let mut m = machine(JobKind::ServiceBuild, &world);
        m.start_build().unwrap();
        m.tick().unwrap();
        m.call_graph("featureX", "sub_task.yaml", &BTreeMap::new()).unwrap();

        let bytes = m.serialize_state().unwrap();
        let recovered = GenerationStateMachine::recover(&bytes, world.services()).unwrap();
        assert_eq!(recovered.serialize_state().unwrap(), bytes);
        assert_eq!(recovered.step(), m.step());
        assert!(recovered.graph().has_loaded("featureX"));
    }

    #[test]
    fn test_recover_rejects_garbage() {
        let world = TestWorld::new();
        let result = GenerationStateMachine::recover(b"{\"meta\": 1}", test_services());
        assert!(matches!(result, Err(CoreError::RecoveryError(_))));
        let result = GenerationStateMachine::recover(b"", world.services());
        assert!(matches!(result, Err(CoreError::RecoveryError(_))));
    }

    #[tokio::test]
    async fn test_worker_plan() {
        let world = TestWorld::new();
        let mut m = machine(JobKind::ServiceBuild, &world);
        m.start_build().unwrap();
        m.tick().unwrap();

        let task_id = m
            .graph()
            .tasks()
            .find(|t| t.status == TaskStatus::Running)
            .map(|t| t.id.clone())
            .unwrap();
        world.liveness.upsert(WorkerNode {
            id: NodeId("fast".to_string()),
            task_id: task_id.clone(),
            alive: true,
            reported_status: None,
            last_heartbeat: Utc::now(),
        });
        world.liveness.upsert(WorkerNode {
            id: NodeId("slow".to_string()),
            task_id: task_id.clone(),
            alive: true,
            reported_status: None,
            last_heartbeat: Utc::now() - chrono::Duration::minutes(10),
        });

        let plan = m.refresh_worker_plan().await;
        let target = &plan.assignments[&task_id];
        assert_eq!(target.target_status, TaskStatus::Running);
        assert_eq!(target.nodes.len(), 2);
        assert_eq!(plan.slow_nodes, vec![NodeId("slow".to_string())]);
        assert_eq!(world.liveness.target(&task_id), Some(target.clone()));
        assert!(world.metrics.last("indexctl_slow_workers").is_some());
    }

    mockall::mock! {
        Planner {}

        #[async_trait::async_trait]
        impl ResourcePlanner for Planner {
            async fn plan(&self, build_id: &BuildId, demand: &[TaskDemand]) -> Result<ResourcePlan, CoreError>;
        }
    }

    #[tokio::test]
    async fn test_planner_failure_keeps_previous_targets() {
        let world = TestWorld::new();
        let mut planner = MockPlanner::new();
        planner
            .expect_plan()
            .withf(|build_id, demand| {
                build_id.0 == "app-1"
                    && demand.len() == 1
                    && demand[0].status == TaskStatus::Running
                    && demand[0].assigned_workers == 0
            })
            .times(1)
            .returning(|_, _| Err(CoreError::ExternalDependencyError("scheduler unreachable".into())));

        let mut services = world.services();
        services.planner = Arc::new(planner);
        let mut m = GenerationStateMachine::new(
            BuildId("app-1".to_string()),
            JobKind::OneShotJob,
            "",
            "/index/app-1",
            BTreeMap::new(),
            services,
        );
        m.start_build().unwrap();
        m.tick().unwrap();

        let plan = m.refresh_worker_plan().await;
        assert_eq!(plan.resource_plan, ResourcePlan::default());
        assert_eq!(plan.assignments.len(), 1);
    }
}
