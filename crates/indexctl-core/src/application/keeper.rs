//! Serialized access to one job
//!
//! Every command and every tick takes the keeper's lock, runs as one
//! transaction of the commit loop, and refreshes the read-only status view.

use crate::{
    application::codec::StateCodec,
    application::commit_loop::TransactionalCommitLoop,
    application::state_machine::{GenerationServices, GenerationStateMachine, WorkerPlan},
    domain::collaborators::StatusLocation,
    domain::flow::FlowId,
    domain::flow_graph::FlowSummary,
    domain::generation::{
        BuildId, FatalErrorRecord, GenerationState, GenerationStep, JobKind, RollbackTarget,
    },
    domain::task::{TaskId, TaskStatus},
    CoreError,
};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Read-only view of a job, refreshed after every command and tick
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationStatus {
    /// Job id
    pub build_id: BuildId,
    /// Job variant
    pub kind: JobKind,
    /// Lifecycle step
    pub step: GenerationStep,
    /// Whether "start build" went through
    pub started: bool,
    /// Whole job suspended
    pub suspended: bool,
    /// First fatal flow error
    pub fatal_error: Option<FatalErrorRecord>,
    /// Number of flows per status
    pub flow_counts: BTreeMap<String, usize>,
    /// A persist failed and the last good state still has to be written
    pub need_sync: bool,
    /// The STOPPED cleanup ran
    pub cleaned_up: bool,
    /// When the view was refreshed
    pub updated_at: DateTime<Utc>,
}

impl GenerationStatus {
    fn of(machine: &GenerationStateMachine, need_sync: bool) -> Self {
        let meta = machine.meta();
        Self {
            build_id: meta.build_id.clone(),
            kind: meta.kind,
            step: meta.step,
            started: meta.started,
            suspended: meta.suspended,
            fatal_error: meta.fatal_error.clone(),
            flow_counts: machine.graph().status_counts(),
            need_sync,
            cleaned_up: machine.is_cleaned_up(),
            updated_at: Utc::now(),
        }
    }
}

struct KeeperInner {
    machine: GenerationStateMachine,
    commit_loop: TransactionalCommitLoop,
}

/// Owns one job's state machine and its commit loop
pub struct GenerationKeeper {
    build_id: BuildId,
    inner: Mutex<KeeperInner>,
    status: RwLock<GenerationStatus>,
    worker_plan: RwLock<WorkerPlan>,
}

impl std::fmt::Debug for GenerationKeeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationKeeper")
            .field("build_id", &self.build_id)
            .field("status", &*self.status.read())
            .finish()
    }
}

impl GenerationKeeper {
    fn assemble(machine: GenerationStateMachine, commit_loop: TransactionalCommitLoop) -> Self {
        let status = GenerationStatus::of(&machine, commit_loop.need_sync_status());
        Self {
            build_id: machine.build_id().clone(),
            inner: Mutex::new(KeeperInner {
                machine,
                commit_loop,
            }),
            status: RwLock::new(status),
            worker_plan: RwLock::new(WorkerPlan::default()),
        }
    }

    /// Keeper of a job that has not been started yet
    pub fn create(
        build_id: BuildId,
        kind: JobKind,
        config_path: &str,
        index_root: &str,
        params: BTreeMap<String, String>,
        services: GenerationServices,
    ) -> Self {
        let codec = StateCodec::new(services.config.compress_threshold_bytes);
        let commit_loop =
            TransactionalCommitLoop::new(build_id.clone(), services.status_store.clone(), codec);
        let machine =
            GenerationStateMachine::new(build_id, kind, config_path, index_root, params, services);
        Self::assemble(machine, commit_loop)
    }

    /// Rebuild a keeper from the stored document of `build_id`
    ///
    /// A job recovered from its stopped marker is considered cleaned up.
    pub async fn recover(
        build_id: &BuildId,
        location: StatusLocation,
        services: GenerationServices,
    ) -> Result<Self, CoreError> {
        let store = services.status_store.clone();
        let stored = match location {
            StatusLocation::Live => store.read(build_id).await?,
            StatusLocation::Stopped => store.read_stopped(build_id).await?,
        }
        .ok_or_else(|| {
            CoreError::RecoveryError(format!("no status document for job {}", build_id))
        })?;

        let raw = StateCodec::decode(&stored)?;
        let mut machine = GenerationStateMachine::recover(&raw, services.clone())?;
        if machine.build_id() != build_id {
            return Err(CoreError::RecoveryError(format!(
                "status document of job {} belongs to job {}",
                build_id,
                machine.build_id()
            )));
        }
        if location == StatusLocation::Stopped {
            machine.mark_cleaned_up();
        }

        let codec = StateCodec::new(services.config.compress_threshold_bytes);
        let mut commit_loop = TransactionalCommitLoop::new(build_id.clone(), store, codec);
        commit_loop.snapshot(&machine)?;
        info!(build_id = %build_id, step = %machine.step(), location = ?location, "Recovered job");
        Ok(Self::assemble(machine, commit_loop))
    }

    /// Job id
    pub fn build_id(&self) -> &BuildId {
        &self.build_id
    }

    /// Last refreshed status view
    pub fn status(&self) -> GenerationStatus {
        self.status.read().clone()
    }

    /// First fatal flow error, if any
    pub fn fatal_error(&self) -> Option<FatalErrorRecord> {
        self.status.read().fatal_error.clone()
    }

    /// Worker plan computed by the last tick
    pub fn worker_plan(&self) -> WorkerPlan {
        self.worker_plan.read().clone()
    }

    fn refresh_status(&self, inner: &KeeperInner) {
        *self.status.write() =
            GenerationStatus::of(&inner.machine, inner.commit_loop.need_sync_status());
    }

    /// Run one command as a transaction
    ///
    /// A pending re-sync of an earlier persist failure is attempted first;
    /// the command is refused while the store keeps failing.
    pub async fn execute<T, F>(&self, name: &str, command: F) -> Result<T, CoreError>
    where
        T: Send,
        F: for<'m> FnOnce(&'m mut GenerationStateMachine) -> BoxFuture<'m, Result<T, CoreError>>,
    {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        if inner.machine.is_cleaned_up() {
            return Err(CoreError::ValidationError(format!(
                "job {} is stopped and cleaned up",
                self.build_id
            )));
        }

        if inner.commit_loop.need_sync_status() {
            if let Err(e) = inner.commit_loop.retry_sync().await {
                inner.machine.count_persist_failure();
                self.refresh_status(inner);
                return Err(e);
            }
        }

        let result = inner
            .commit_loop
            .transact(&mut inner.machine, name, command)
            .await;
        match &result {
            Ok(_) => inner.machine.dispatch_events(),
            Err(e @ CoreError::PersistError(_)) => {
                warn!(build_id = %self.build_id, command = name, error = %e, "Command not persisted");
                inner.machine.count_persist_failure();
            }
            Err(e) => debug!(build_id = %self.build_id, command = name, error = %e, "Command rejected"),
        }
        self.refresh_status(inner);
        result
    }

    /// One reconciliation tick
    pub async fn tick(&self) -> Result<(), CoreError> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        if inner.commit_loop.need_sync_status() {
            let result = inner.commit_loop.retry_sync().await;
            if let Err(e) = &result {
                warn!(build_id = %self.build_id, error = %e, "Status re-sync failed");
                inner.machine.count_persist_failure();
            }
            self.refresh_status(inner);
            return result;
        }

        if inner.machine.step() == GenerationStep::Stopped {
            if !inner.machine.is_cleaned_up() {
                inner.machine.cleanup_stopped().await?;
                *self.worker_plan.write() = WorkerPlan::default();
                self.refresh_status(inner);
            }
            return Ok(());
        }

        let ticked = inner
            .commit_loop
            .transact(&mut inner.machine, "tick", |m| Box::pin(async move { m.tick() }))
            .await;
        if let Err(e) = ticked {
            if matches!(e, CoreError::PersistError(_)) {
                inner.machine.count_persist_failure();
            }
            self.refresh_status(inner);
            return Err(e);
        }
        inner.machine.dispatch_events();

        if inner.machine.meta().started {
            let plan = inner.machine.refresh_worker_plan().await;
            *self.worker_plan.write() = plan;
        }
        self.refresh_status(inner);
        Ok(())
    }

    /// Whether the job is STOPPED and cleaned up
    pub fn is_finished(&self) -> bool {
        let status = self.status.read();
        status.step == GenerationStep::Stopped && status.cleaned_up
    }

    /// Summaries of every flow
    pub async fn flow_summaries(&self) -> Vec<FlowSummary> {
        self.inner.lock().await.machine.graph().summaries()
    }

    /// Graphviz rendering of the flow graph
    pub async fn dot_string(&self, fill_tasks: bool) -> String {
        self.inner.lock().await.machine.graph().get_dot_string(fill_tasks)
    }

    /// The document the job would persist right now
    pub async fn state(&self) -> GenerationState {
        self.inner.lock().await.machine.to_state()
    }

    /// Start the job
    pub async fn start_build(&self) -> Result<(), CoreError> {
        self.execute("start_build", |m| Box::pin(async move { m.start_build() }))
            .await
    }

    /// Stop the job
    pub async fn stop_build(&self) -> Result<(), CoreError> {
        self.execute("stop_build", |m| Box::pin(async move { m.stop_build() }))
            .await
    }

    /// Suspend every flow
    pub async fn suspend_build(&self) -> Result<(), CoreError> {
        self.execute("suspend_build", |m| Box::pin(async move { m.suspend_build() }))
            .await
    }

    /// Resume every flow
    pub async fn resume_build(&self) -> Result<(), CoreError> {
        self.execute("resume_build", |m| Box::pin(async move { m.resume_build() }))
            .await
    }

    /// Suspend one flow
    pub async fn suspend_flow(&self, flow_id: FlowId) -> Result<(), CoreError> {
        self.execute("suspend_flow", move |m| {
            Box::pin(async move { m.suspend_flow(&flow_id) })
        })
        .await
    }

    /// Resume one flow
    pub async fn resume_flow(&self, flow_id: FlowId) -> Result<(), CoreError> {
        self.execute("resume_flow", move |m| {
            Box::pin(async move { m.resume_flow(&flow_id) })
        })
        .await
    }

    /// Stop one flow
    pub async fn stop_flow(&self, flow_id: FlowId) -> Result<(), CoreError> {
        self.execute("stop_flow", move |m| Box::pin(async move { m.stop_flow(&flow_id) }))
            .await
    }

    /// Start a named sub-task
    pub async fn start_task(
        &self,
        name: String,
        template: String,
        params: BTreeMap<String, String>,
    ) -> Result<Vec<FlowId>, CoreError> {
        self.execute("start_task", move |m| {
            Box::pin(async move { m.start_task(&name, &template, &params) })
        })
        .await
    }

    /// Stop a named sub-task
    pub async fn stop_task(&self, name: String) -> Result<(), CoreError> {
        self.execute("stop_task", move |m| Box::pin(async move { m.stop_task(&name) }))
            .await
    }

    /// Load a named sub-graph once
    pub async fn call_graph(
        &self,
        graph_name: String,
        template: String,
        params: BTreeMap<String, String>,
    ) -> Result<Vec<FlowId>, CoreError> {
        self.execute("call_graph", move |m| {
            Box::pin(async move { m.call_graph(&graph_name, &template, &params) })
        })
        .await
    }

    /// Roll one cluster back
    pub async fn rollback(&self, cluster: String, target: RollbackTarget) -> Result<(), CoreError> {
        self.execute("rollback", move |m| {
            Box::pin(async move { m.rollback(&cluster, target).await })
        })
        .await
    }

    /// Mark a checkpoint
    pub async fn mark_checkpoint(&self, cluster: String, version: u64) -> Result<u64, CoreError> {
        self.execute("mark_checkpoint", move |m| {
            Box::pin(async move { m.mark_checkpoint(&cluster, version).await })
        })
        .await
    }

    /// Create a savepoint
    pub async fn create_savepoint(&self, cluster: String, checkpoint_id: u64) -> Result<(), CoreError> {
        self.execute("create_savepoint", move |m| {
            Box::pin(async move { m.create_savepoint(&cluster, checkpoint_id).await })
        })
        .await
    }

    /// Remove a savepoint
    pub async fn remove_savepoint(&self, cluster: String, checkpoint_id: u64) -> Result<(), CoreError> {
        self.execute("remove_savepoint", move |m| {
            Box::pin(async move { m.remove_savepoint(&cluster, checkpoint_id).await })
        })
        .await
    }

    /// Commit an output version
    pub async fn commit_version(&self, cluster: String, version: u64) -> Result<(), CoreError> {
        self.execute("commit_version", move |m| {
            Box::pin(async move { m.commit_version(&cluster, version).await })
        })
        .await
    }

    /// Switch to a new configuration
    pub async fn update_config(
        &self,
        config_path: String,
        params: BTreeMap<String, String>,
    ) -> Result<(), CoreError> {
        self.execute("update_config", move |m| {
            Box::pin(async move { m.update_config(&config_path, &params) })
        })
        .await
    }

    /// Apply a task status reported out of band
    pub async fn report_task_status(&self, task_id: TaskId, status: TaskStatus) -> Result<(), CoreError> {
        self.execute("report_task_status", move |m| {
            Box::pin(async move { m.report_task_status(&task_id, status) })
        })
        .await
    }

    /// Record a flow error
    pub async fn report_flow_error(
        &self,
        flow_id: FlowId,
        message: String,
        is_fatal: bool,
    ) -> Result<(), CoreError> {
        self.execute("report_flow_error", move |m| {
            Box::pin(async move { m.report_flow_error(&flow_id, &message, is_fatal) })
        })
        .await
    }

    /// Set a property on one flow
    pub async fn set_flow_property(
        &self,
        flow_id: FlowId,
        key: String,
        value: String,
    ) -> Result<(), CoreError> {
        self.execute("set_flow_property", move |m| {
            Box::pin(async move { m.set_flow_property(&flow_id, &key, &value) })
        })
        .await
    }

    /// Remove a flow from the graph
    pub async fn remove_flow(&self, flow_id: FlowId, clear_tasks: bool) -> Result<(), CoreError> {
        self.execute("remove_flow", move |m| {
            Box::pin(async move { m.remove_flow(&flow_id, clear_tasks) })
        })
        .await
    }
}
