use crate::{
    domain::events::{DomainEvent, FlowStatusChanged},
    domain::task::{Task, TaskId, TaskKindRegistry, TaskStatus},
    CoreError,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use tracing::{debug, warn};

/// Flow status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    /// Created, waiting for its upstream dependencies
    Init,

    /// Tasks are materialized and running
    Running,

    /// Task set completed, finalizing
    Finishing,

    /// Completed successfully
    Finish,

    /// Asked to stop, waiting for tasks to confirm
    Stopping,

    /// Stopped
    Stopped,

    /// Asked to suspend, waiting for tasks to confirm
    Suspending,

    /// Suspended until resumed
    Suspended,

    /// Failed, needs an operator to stop it
    Error,

    /// Failed unrecoverably, excluded from any automatic retry
    Fatal,
}

impl FlowStatus {
    /// Every status, in lifecycle order
    pub const ALL: [FlowStatus; 10] = [
        FlowStatus::Init,
        FlowStatus::Running,
        FlowStatus::Finishing,
        FlowStatus::Finish,
        FlowStatus::Stopping,
        FlowStatus::Stopped,
        FlowStatus::Suspending,
        FlowStatus::Suspended,
        FlowStatus::Error,
        FlowStatus::Fatal,
    ];

    /// Whether automation will never move the flow again
    pub fn is_terminal(self) -> bool {
        matches!(self, FlowStatus::Finish | FlowStatus::Stopped | FlowStatus::Fatal)
    }

    /// Whether the checked transition `self -> next` is legal
    pub fn can_transition_to(self, next: FlowStatus) -> bool {
        use FlowStatus::*;
        match self {
            Init => matches!(next, Running | Suspending | Stopping),
            Running => matches!(next, Finishing | Stopping | Suspending | Error | Fatal),
            Finishing => next == Finish,
            Stopping => next == Stopped,
            // back to the pre-suspend status only through resume
            Suspending => matches!(next, Suspended | Stopping | Init | Running),
            Suspended => matches!(next, Stopping | Init | Running),
            Error => next == Stopping,
            Finish | Stopped | Fatal => false,
        }
    }

    /// Lowercase name, as used in templates and dot output
    pub fn as_str(self) -> &'static str {
        match self {
            FlowStatus::Init => "init",
            FlowStatus::Running => "running",
            FlowStatus::Finishing => "finishing",
            FlowStatus::Finish => "finish",
            FlowStatus::Stopping => "stopping",
            FlowStatus::Stopped => "stopped",
            FlowStatus::Suspending => "suspending",
            FlowStatus::Suspended => "suspended",
            FlowStatus::Error => "error",
            FlowStatus::Fatal => "fatal",
        }
    }
}

impl fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value object: Flow ID, unique within a graph
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowId(pub String);

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Value object: id of one template instantiation
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GraphId(pub String);

impl fmt::Display for GraphId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Bitmask over the upstream statuses a dependency waits for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WaitMask(u8);

impl WaitMask {
    /// Satisfied by an upstream in `finish`
    pub const FINISH: WaitMask = WaitMask(0b01);
    /// Satisfied by an upstream in `stopped`
    pub const STOP: WaitMask = WaitMask(0b10);

    /// Combine two masks
    pub const fn union(self, other: WaitMask) -> WaitMask {
        WaitMask(self.0 | other.0)
    }

    /// Whether every bit of `other` is set
    pub fn contains(self, other: WaitMask) -> bool {
        self.0 & other.0 == other.0
    }

    /// No bit set
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether an upstream in `status` releases this dependency
    pub fn is_satisfied_by(self, status: FlowStatus) -> bool {
        match status {
            FlowStatus::Finish => self.contains(WaitMask::FINISH),
            FlowStatus::Stopped => self.contains(WaitMask::STOP),
            _ => false,
        }
    }

    /// Parse template names (`finish`, `stop`)
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<WaitMask, CoreError> {
        let mut mask = WaitMask(0);
        for name in names {
            mask = match name.as_ref() {
                "finish" => mask.union(WaitMask::FINISH),
                "stop" => mask.union(WaitMask::STOP),
                other => {
                    return Err(CoreError::TemplateError(format!(
                        "unknown wait condition: {}",
                        other
                    )))
                }
            };
        }
        if mask.is_empty() {
            return Err(CoreError::TemplateError(
                "wait condition must not be empty".to_string(),
            ));
        }
        Ok(mask)
    }
}

impl fmt::Display for WaitMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.contains(WaitMask::FINISH) {
            parts.push("finish");
        }
        if self.contains(WaitMask::STOP) {
            parts.push("stop");
        }
        f.write_str(&parts.join("|"))
    }
}

/// What to do when a referenced upstream flow no longer exists
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingAction {
    /// Stop the waiting flow
    #[default]
    AutoStop,

    /// Treat the dependency as satisfied
    Ignore,

    /// Satisfied if the upstream is known to have completed before removal
    PassBefore,
}

/// One upstream wait condition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamDependency {
    /// Upstream flow
    pub flow_id: FlowId,

    /// Statuses of the upstream that release this flow
    pub wait_mask: WaitMask,

    /// Behaviour when the upstream is gone
    #[serde(default)]
    pub missing_action: MissingAction,
}

/// Last error recorded on a flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowErrorRecord {
    /// Error message
    pub message: String,

    /// Whether the error was fatal
    pub fatal: bool,

    /// When it was recorded
    pub timestamp: DateTime<Utc>,
}

/// Read-only view of upstream statuses used by one tick
#[derive(Debug, Default, Clone)]
pub struct UpstreamSnapshot {
    current: HashMap<FlowId, FlowStatus>,
    completed: HashMap<FlowId, FlowStatus>,
}

impl UpstreamSnapshot {
    /// Build a snapshot from live statuses and the removed-flow cache
    pub fn new(
        current: HashMap<FlowId, FlowStatus>,
        completed: HashMap<FlowId, FlowStatus>,
    ) -> Self {
        Self { current, completed }
    }

    /// Status of a flow still in the graph
    pub fn current(&self, flow_id: &FlowId) -> Option<FlowStatus> {
        self.current.get(flow_id).copied()
    }

    /// Final status of a flow removed from the graph
    pub fn completed(&self, flow_id: &FlowId) -> Option<FlowStatus> {
        self.completed.get(flow_id).copied()
    }
}

/// Outcome of an upstream readiness check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Every dependency is released
    Ready,
    /// At least one dependency still waits
    Waiting,
    /// A missing upstream with `auto_stop` was found
    AutoStop(FlowId),
}

/// Aggregate: one schedulable node of the per-generation flow graph
#[derive(Debug, Serialize, Deserialize)]
pub struct Flow {
    /// Unique identifier within the graph
    pub id: FlowId,

    /// Template instantiation this flow belongs to
    pub graph_id: GraphId,

    /// Name of the flow inside its template
    pub name: String,

    /// Template file the flow was instantiated from
    pub template: String,

    /// Parameters the template was instantiated with
    pub params: BTreeMap<String, String>,

    /// Non-unique lookup tags
    pub tags: BTreeSet<String>,

    /// Current status
    status: FlowStatus,

    /// Ordered upstream wait conditions
    pub upstreams: Vec<UpstreamDependency>,

    /// Flows allowed to run alongside without ordering
    pub friend_flows: BTreeSet<FlowId>,

    /// Small derived values shared with tasks and introspection tools
    pub properties: BTreeMap<String, String>,

    /// Tasks bound to this flow
    pub task_ids: Vec<TaskId>,

    /// Status to return to on resume
    resume_status: Option<FlowStatus>,

    /// Missing upstreams already resolved, with the action applied
    missing_resolutions: BTreeMap<FlowId, MissingAction>,

    /// Last recorded error
    last_error: Option<FlowErrorRecord>,

    /// Set once a fatal error was recorded
    fatal: bool,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last status change
    pub updated_at: DateTime<Utc>,

    /// When the flow reached a terminal status
    terminal_at: Option<DateTime<Utc>>,

    /// Domain events
    #[serde(skip)]
    events: Vec<Box<dyn DomainEvent>>,
}

// Manually implement Clone for Flow
impl Clone for Flow {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            graph_id: self.graph_id.clone(),
            name: self.name.clone(),
            template: self.template.clone(),
            params: self.params.clone(),
            tags: self.tags.clone(),
            status: self.status,
            upstreams: self.upstreams.clone(),
            friend_flows: self.friend_flows.clone(),
            properties: self.properties.clone(),
            task_ids: self.task_ids.clone(),
            resume_status: self.resume_status,
            missing_resolutions: self.missing_resolutions.clone(),
            last_error: self.last_error.clone(),
            fatal: self.fatal,
            created_at: self.created_at,
            updated_at: self.updated_at,
            terminal_at: self.terminal_at,
            events: Vec::new(), // We don't clone domain events
        }
    }
}

impl Flow {
    /// Bind a template instantiation to a fresh flow in status `init`
    pub fn init(
        id: FlowId,
        graph_id: GraphId,
        name: &str,
        template: &str,
        params: BTreeMap<String, String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            graph_id,
            name: name.to_string(),
            template: template.to_string(),
            params,
            tags: BTreeSet::new(),
            status: FlowStatus::Init,
            upstreams: Vec::new(),
            friend_flows: BTreeSet::new(),
            properties: BTreeMap::new(),
            task_ids: Vec::new(),
            resume_status: None,
            missing_resolutions: BTreeMap::new(),
            last_error: None,
            fatal: false,
            created_at: now,
            updated_at: now,
            terminal_at: None,
            events: Vec::new(),
        }
    }

    /// Current status
    #[inline]
    pub fn status(&self) -> FlowStatus {
        self.status
    }

    /// Whether a fatal error was recorded
    #[inline]
    pub fn is_fatal(&self) -> bool {
        self.fatal
    }

    /// Last recorded error
    pub fn last_error(&self) -> Option<&FlowErrorRecord> {
        self.last_error.as_ref()
    }

    /// When the flow became terminal
    pub fn terminal_at(&self) -> Option<DateTime<Utc>> {
        self.terminal_at
    }

    /// Missing upstream resolutions applied so far
    pub fn missing_resolutions(&self) -> &BTreeMap<FlowId, MissingAction> {
        &self.missing_resolutions
    }

    /// Check if the flow carries a tag
    #[inline]
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// Set a property visible to tasks and introspection
    pub fn set_property(&mut self, key: &str, value: &str) {
        self.properties.insert(key.to_string(), value.to_string());
    }

    /// Read a property
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(|v| v.as_str())
    }

    fn transition(&mut self, next: FlowStatus) -> Result<(), CoreError> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::InvalidTransition(format!(
                "flow {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        let now = Utc::now();
        let from = self.status;
        self.status = next;
        self.updated_at = now;
        if next.is_terminal() {
            self.terminal_at = Some(now);
        }
        debug!(flow_id = %self.id, from = %from, to = %next, "Flow status changed");
        self.record_event(Box::new(FlowStatusChanged {
            flow_id: self.id.clone(),
            from,
            to: next,
            timestamp: now,
        }));
        Ok(())
    }

    fn own_tasks<'a>(&'a self, tasks: &'a BTreeMap<TaskId, Task>) -> impl Iterator<Item = &'a Task> {
        self.task_ids.iter().filter_map(move |id| tasks.get(id))
    }

    /// Advance the flow's own status from the statuses of its tasks
    pub fn settle(&mut self, tasks: &BTreeMap<TaskId, Task>) -> Result<(), CoreError> {
        match self.status {
            FlowStatus::Running => {
                let complete = self
                    .own_tasks(tasks)
                    .all(|t| t.status == TaskStatus::Finished);
                if complete {
                    self.transition(FlowStatus::Finishing)?;
                    self.transition(FlowStatus::Finish)?;
                    return Ok(());
                }
                // every task ended and at least one stopped on its own
                let stopped = self.own_tasks(tasks).all(|t| t.status.is_final());
                if stopped {
                    warn!(flow_id = %self.id, "All tasks stopped without a stop request");
                    self.transition(FlowStatus::Stopping)?;
                    self.transition(FlowStatus::Stopped)?;
                }
            }
            FlowStatus::Finishing => self.transition(FlowStatus::Finish)?,
            FlowStatus::Stopping => {
                if !self.own_tasks(tasks).any(|t| t.status.is_live()) {
                    self.transition(FlowStatus::Stopped)?;
                }
            }
            FlowStatus::Suspending => {
                let settled = !self.own_tasks(tasks).any(|t| {
                    matches!(t.status, TaskStatus::Running | TaskStatus::Suspending)
                });
                if settled {
                    self.transition(FlowStatus::Suspended)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Evaluate every upstream dependency against `snapshot`
    ///
    /// Missing upstreams get their `missing_action` applied once and the
    /// resolution is remembered; the first missing `auto_stop` dependency
    /// short-circuits with [`Readiness::AutoStop`].
    pub fn is_upstream_flow_ready(
        &mut self,
        snapshot: &UpstreamSnapshot,
    ) -> Result<Readiness, CoreError> {
        let mut waiting = false;
        for dep in &self.upstreams {
            if self.missing_resolutions.contains_key(&dep.flow_id) {
                continue;
            }
            match snapshot.current(&dep.flow_id) {
                Some(status) => {
                    if !dep.wait_mask.is_satisfied_by(status) {
                        waiting = true;
                    }
                }
                None => {
                    let action = match dep.missing_action {
                        MissingAction::AutoStop => {
                            self.missing_resolutions
                                .insert(dep.flow_id.clone(), MissingAction::AutoStop);
                            return Ok(Readiness::AutoStop(dep.flow_id.clone()));
                        }
                        MissingAction::Ignore => MissingAction::Ignore,
                        MissingAction::PassBefore => match snapshot.completed(&dep.flow_id) {
                            Some(final_status) if dep.wait_mask.is_satisfied_by(final_status) => {
                                MissingAction::PassBefore
                            }
                            _ => {
                                return Err(CoreError::DependencyMissingError(format!(
                                    "flow {} waits on removed flow {} with no recorded completion",
                                    self.id, dep.flow_id
                                )))
                            }
                        },
                    };
                    debug!(flow_id = %self.id, upstream = %dep.flow_id, action = ?action, "Resolved missing upstream");
                    self.missing_resolutions.insert(dep.flow_id.clone(), action);
                }
            }
        }
        Ok(if waiting {
            Readiness::Waiting
        } else {
            Readiness::Ready
        })
    }

    /// Materialize the tasks and enter `running`
    fn start(
        &mut self,
        tasks: &mut BTreeMap<TaskId, Task>,
        registry: &TaskKindRegistry,
    ) -> Result<(), CoreError> {
        // validate everything before touching any task
        for task in self.own_tasks(tasks) {
            registry.get(&task.kind)?.validate(&task.params)?;
        }
        self.transition(FlowStatus::Running)?;
        for id in &self.task_ids {
            if let Some(task) = tasks.get_mut(id) {
                task.materialize();
            }
        }
        Ok(())
    }

    /// Single idempotent advance of this flow
    ///
    /// Settles the flow's own status, starts it if it is in `init` and every
    /// upstream is released, then settles again so a flow without tasks
    /// reaches `finish` in the same call.
    pub fn step_run(
        &mut self,
        tasks: &mut BTreeMap<TaskId, Task>,
        snapshot: &UpstreamSnapshot,
        registry: &TaskKindRegistry,
    ) -> Result<(), CoreError> {
        self.settle(tasks)?;

        if self.status == FlowStatus::Init {
            let readiness = match self.is_upstream_flow_ready(snapshot) {
                Ok(readiness) => readiness,
                Err(e) => {
                    self.note_error(&e.to_string());
                    return Err(e);
                }
            };
            match readiness {
                Readiness::Waiting => {}
                Readiness::Ready => self.start(tasks, registry)?,
                Readiness::AutoStop(missing) => {
                    warn!(flow_id = %self.id, upstream = %missing, "Upstream flow missing, stopping flow");
                    self.stop_flow(tasks)?;
                }
            }
        }

        self.settle(tasks)
    }

    /// Suspend from `init` or `running`; no-op if already suspending/suspended
    pub fn suspend_flow(&mut self, tasks: &mut BTreeMap<TaskId, Task>) -> Result<(), CoreError> {
        match self.status {
            FlowStatus::Suspending | FlowStatus::Suspended => Ok(()),
            FlowStatus::Fatal => Err(self.fatal_error()),
            FlowStatus::Init | FlowStatus::Running => {
                self.resume_status = Some(self.status);
                self.transition(FlowStatus::Suspending)?;
                for id in &self.task_ids {
                    if let Some(task) = tasks.get_mut(id) {
                        task.request_suspend();
                    }
                }
                Ok(())
            }
            other => Err(CoreError::InvalidTransition(format!(
                "cannot suspend flow {} in status {}",
                self.id, other
            ))),
        }
    }

    /// Reverse of [`Flow::suspend_flow`]; no-op if already `init`/`running`
    pub fn resume_flow(&mut self, tasks: &mut BTreeMap<TaskId, Task>) -> Result<(), CoreError> {
        match self.status {
            FlowStatus::Init | FlowStatus::Running => Ok(()),
            FlowStatus::Fatal => Err(self.fatal_error()),
            FlowStatus::Suspending | FlowStatus::Suspended => {
                let target = self.resume_status.take().unwrap_or(FlowStatus::Init);
                self.transition(target)?;
                for id in &self.task_ids {
                    if let Some(task) = tasks.get_mut(id) {
                        task.resume();
                    }
                }
                Ok(())
            }
            other => Err(CoreError::InvalidTransition(format!(
                "cannot resume flow {} in status {}",
                self.id, other
            ))),
        }
    }

    /// Cooperative stop: tasks are asked to stop, never killed
    pub fn stop_flow(&mut self, tasks: &mut BTreeMap<TaskId, Task>) -> Result<(), CoreError> {
        match self.status {
            FlowStatus::Stopping | FlowStatus::Stopped => Ok(()),
            FlowStatus::Fatal => Err(self.fatal_error()),
            FlowStatus::Finishing | FlowStatus::Finish => {
                Err(CoreError::InvalidTransition(format!(
                    "cannot stop flow {} in status {}",
                    self.id, self.status
                )))
            }
            _ => {
                self.resume_status = None;
                self.transition(FlowStatus::Stopping)?;
                for id in &self.task_ids {
                    if let Some(task) = tasks.get_mut(id) {
                        task.request_stop();
                    }
                }
                Ok(())
            }
        }
    }

    /// Record an error; the flow must be `running`
    pub fn set_error(&mut self, message: &str, is_fatal: bool) -> Result<(), CoreError> {
        let next = if is_fatal {
            FlowStatus::Fatal
        } else {
            FlowStatus::Error
        };
        self.transition(next)?;
        self.last_error = Some(FlowErrorRecord {
            message: message.to_string(),
            fatal: is_fatal,
            timestamp: self.updated_at,
        });
        if is_fatal {
            self.fatal = true;
        }
        Ok(())
    }

    fn note_error(&mut self, message: &str) {
        let unchanged = self
            .last_error
            .as_ref()
            .map(|e| e.message == message)
            .unwrap_or(false);
        if !unchanged {
            self.last_error = Some(FlowErrorRecord {
                message: message.to_string(),
                fatal: false,
                timestamp: Utc::now(),
            });
        }
    }

    fn fatal_error(&self) -> CoreError {
        CoreError::FatalFlowError(format!(
            "flow {} is fatal: {}",
            self.id,
            self.last_error.as_ref().map(|e| e.message.as_str()).unwrap_or("unknown")
        ))
    }

    /// Terminal, non-fatal and older than `retention`
    pub fn is_expired(&self, now: DateTime<Utc>, retention: chrono::Duration) -> bool {
        if !matches!(self.status, FlowStatus::Finish | FlowStatus::Stopped) {
            return false;
        }
        self.terminal_at
            .map(|at| at + retention <= now)
            .unwrap_or(false)
    }

    /// Record a domain event
    pub fn record_event(&mut self, event: Box<dyn DomainEvent>) {
        self.events.push(event);
    }

    /// Get and clear all domain events
    pub fn take_events(&mut self) -> Vec<Box<dyn DomainEvent>> {
        std::mem::take(&mut self.events)
    }
}
