use crate::{
    domain::events::{DomainEvent, FlowRemoved},
    domain::flow::{Flow, FlowId, FlowStatus, GraphId, UpstreamDependency, UpstreamSnapshot},
    domain::task::{Task, TaskId, TaskKindRegistry, TaskStatus},
    domain::template::{GraphSpec, TemplateInterpreter, TemplateLoader},
    CoreError,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::{self, Write as _};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Collaborators a flow graph is constructed with
#[derive(Clone)]
pub struct GraphContext {
    /// Known task kinds
    pub registry: TaskKindRegistry,

    /// Resolves template files
    pub loader: Arc<dyn TemplateLoader>,

    /// Instantiates template text
    pub interpreter: Arc<dyn TemplateInterpreter>,

    /// Root search path handed to the loader
    pub template_root: String,
}

impl fmt::Debug for GraphContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphContext")
            .field("registry", &self.registry)
            .field("template_root", &self.template_root)
            .finish()
    }
}

/// Serialized form of a [`FlowGraph`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowGraphSnapshot {
    /// Every flow, ordered by id
    pub flows: Vec<Flow>,

    /// Every task, ordered by id
    pub tasks: Vec<Task>,

    /// Final statuses of removed flows
    #[serde(default)]
    pub removed: BTreeMap<FlowId, FlowStatus>,

    /// Names of one-shot sub-graphs already loaded, with load time
    #[serde(default)]
    pub call_graph_history: BTreeMap<String, DateTime<Utc>>,

    /// Next flow id to allocate
    pub next_flow_id: u64,

    /// Next graph id to allocate
    pub next_graph_id: u64,
}

/// Read-only description of one flow for introspection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowSummary {
    /// Flow id
    pub id: FlowId,
    /// Template instantiation
    pub graph_id: GraphId,
    /// Name inside its template
    pub name: String,
    /// Current status
    pub status: FlowStatus,
    /// Tags
    pub tags: Vec<String>,
    /// Upstream flows with their wait masks
    pub upstreams: Vec<(FlowId, String)>,
    /// Number of tasks
    pub task_count: usize,
    /// Last error message
    pub last_error: Option<String>,
}

/// Aggregate: the per-generation DAG of flows and the tasks they own
pub struct FlowGraph {
    flows: BTreeMap<FlowId, Flow>,
    tasks: BTreeMap<TaskId, Task>,
    tag_index: HashMap<String, BTreeSet<FlowId>>,
    removed: BTreeMap<FlowId, FlowStatus>,
    call_graph_history: BTreeMap<String, DateTime<Utc>>,
    next_flow_id: u64,
    next_graph_id: u64,
    context: GraphContext,
    events: Vec<Box<dyn DomainEvent>>,
}

impl fmt::Debug for FlowGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowGraph")
            .field("flows", &self.flows.len())
            .field("tasks", &self.tasks.len())
            .field("next_flow_id", &self.next_flow_id)
            .field("next_graph_id", &self.next_graph_id)
            .finish()
    }
}

impl FlowGraph {
    /// Create an empty graph
    pub fn new(context: GraphContext) -> Self {
        Self {
            flows: BTreeMap::new(),
            tasks: BTreeMap::new(),
            tag_index: HashMap::new(),
            removed: BTreeMap::new(),
            call_graph_history: BTreeMap::new(),
            next_flow_id: 1,
            next_graph_id: 1,
            context,
            events: Vec::new(),
        }
    }

    /// Collaborators of this graph
    pub fn context(&self) -> &GraphContext {
        &self.context
    }

    fn instantiate_template(
        &self,
        template: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<GraphSpec, CoreError> {
        let script = self.context.loader.load(&self.context.template_root, template)?;
        self.context.interpreter.instantiate(&script, params)
    }

    fn allocate_flow_id(&self, counter: &mut u64, taken: &BTreeSet<FlowId>) -> FlowId {
        loop {
            let candidate = FlowId(counter.to_string());
            *counter += 1;
            if !self.flows.contains_key(&candidate)
                && !self.removed.contains_key(&candidate)
                && !taken.contains(&candidate)
            {
                return candidate;
            }
        }
    }

    /// Build flows and tasks for `spec` without touching the graph
    fn build_flows(
        &self,
        spec: &GraphSpec,
        template: &str,
        params: &BTreeMap<String, String>,
        explicit_id: Option<FlowId>,
    ) -> Result<(Vec<Flow>, Vec<Task>, u64, u64), CoreError> {
        let mut next_flow_id = self.next_flow_id;
        let graph_id = GraphId(self.next_graph_id.to_string());

        let mut taken = BTreeSet::new();
        let mut local_ids: HashMap<&str, FlowId> = HashMap::new();
        for (index, flow_spec) in spec.flows.iter().enumerate() {
            let id = match (&explicit_id, index) {
                (Some(id), 0) => id.clone(),
                _ => self.allocate_flow_id(&mut next_flow_id, &taken),
            };
            taken.insert(id.clone());
            local_ids.insert(flow_spec.name.as_str(), id);
        }

        let mut flows = Vec::with_capacity(spec.flows.len());
        let mut tasks = Vec::new();
        for flow_spec in &spec.flows {
            let id = local_ids
                .get(flow_spec.name.as_str())
                .cloned()
                .ok_or_else(|| CoreError::TemplateError(format!("unknown flow {}", flow_spec.name)))?;
            let mut flow = Flow::init(
                id.clone(),
                graph_id.clone(),
                &flow_spec.name,
                template,
                params.clone(),
            );
            flow.tags = flow_spec.tags.iter().cloned().collect();
            flow.properties = flow_spec.properties.clone();

            for friend in &flow_spec.friends {
                if let Some(friend_id) = local_ids.get(friend.as_str()) {
                    flow.friend_flows.insert(friend_id.clone());
                }
            }

            for upstream in &flow_spec.upstream {
                let flow_id = match (&upstream.flow, &upstream.flow_id) {
                    (Some(name), _) => local_ids.get(name.as_str()).cloned().ok_or_else(|| {
                        CoreError::TemplateError(format!("unknown upstream flow {}", name))
                    })?,
                    (None, Some(existing)) => FlowId(existing.clone()),
                    (None, None) => {
                        return Err(CoreError::TemplateError(format!(
                            "upstream of flow {} has no target",
                            flow_spec.name
                        )))
                    }
                };
                flow.upstreams.push(UpstreamDependency {
                    flow_id,
                    wait_mask: upstream.wait_mask()?,
                    missing_action: upstream.missing,
                });
            }

            for task_spec in &flow_spec.tasks {
                self.context
                    .registry
                    .get(&task_spec.kind)?
                    .validate(&task_spec.params)?;
                let task = Task::new(&id, &task_spec.name, &task_spec.kind, task_spec.params.clone());
                flow.task_ids.push(task.id.clone());
                tasks.push(task);
            }
            flows.push(flow);
        }

        Ok((flows, tasks, next_flow_id, self.next_graph_id + 1))
    }

    fn insert_flows(&mut self, built: (Vec<Flow>, Vec<Task>, u64, u64)) -> Vec<FlowId> {
        let (flows, tasks, next_flow_id, next_graph_id) = built;
        self.next_flow_id = next_flow_id;
        self.next_graph_id = next_graph_id;
        for task in tasks {
            self.tasks.insert(task.id.clone(), task);
        }
        let mut ids = Vec::with_capacity(flows.len());
        for flow in flows {
            for tag in &flow.tags {
                self.tag_index
                    .entry(tag.clone())
                    .or_default()
                    .insert(flow.id.clone());
            }
            ids.push(flow.id.clone());
            self.flows.insert(flow.id.clone(), flow);
        }
        ids
    }

    /// Instantiate a single-flow template as a new flow in status `init`
    pub fn create_flow(
        &mut self,
        template: &str,
        flow_id: Option<FlowId>,
        params: &BTreeMap<String, String>,
    ) -> Result<FlowId, CoreError> {
        if let Some(id) = &flow_id {
            if self.flows.contains_key(id) || self.removed.contains_key(id) {
                return Err(CoreError::ValidationError(format!("flow id {} already in use", id)));
            }
        }

        let spec = self.instantiate_template(template, params)?;
        if spec.flows.len() != 1 {
            return Err(CoreError::TemplateError(format!(
                "template {} must describe exactly one flow, found {}",
                template,
                spec.flows.len()
            )));
        }
        if spec.flows[0].tasks.is_empty() {
            return Err(CoreError::TemplateError(format!(
                "template {} produces no tasks",
                template
            )));
        }

        let built = self.build_flows(&spec, template, params, flow_id)?;
        let ids = self.insert_flows(built);
        ids.into_iter()
            .next()
            .ok_or_else(|| CoreError::TemplateError(format!("template {} produced no flow", template)))
    }

    /// Instantiate every flow of `template`
    ///
    /// A non-empty `graph_name` makes the call idempotent: once recorded in
    /// the call history, later calls succeed without creating anything.
    pub fn load_sub_graph(
        &mut self,
        graph_name: &str,
        template: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<Vec<FlowId>, CoreError> {
        if !graph_name.is_empty() && self.call_graph_history.contains_key(graph_name) {
            debug!(graph_name, "Sub-graph already loaded");
            return Ok(Vec::new());
        }

        let spec = self.instantiate_template(template, params)?;
        let built = self.build_flows(&spec, template, params, None)?;
        let ids = self.insert_flows(built);
        if !graph_name.is_empty() {
            self.call_graph_history.insert(graph_name.to_string(), Utc::now());
        }
        info!(graph_name, template, flows = ids.len(), "Loaded sub-graph");
        Ok(ids)
    }

    /// Whether a named sub-graph was already loaded
    pub fn has_loaded(&self, graph_name: &str) -> bool {
        self.call_graph_history.contains_key(graph_name)
    }

    /// Names of loaded one-shot sub-graphs
    pub fn call_graph_history(&self) -> &BTreeMap<String, DateTime<Utc>> {
        &self.call_graph_history
    }

    fn upstream_snapshot(&self) -> UpstreamSnapshot {
        UpstreamSnapshot::new(
            self.flows.iter().map(|(id, f)| (id.clone(), f.status())).collect(),
            self.removed.iter().map(|(id, s)| (id.clone(), *s)).collect(),
        )
    }

    /// Advance every flow once
    ///
    /// All flows settle first, then each flow steps against the same status
    /// snapshot, so the outcome does not depend on iteration order. Failures
    /// of single flows are returned, the other flows still advance.
    pub fn step_run(&mut self) -> Vec<(FlowId, CoreError)> {
        let mut failures = Vec::new();

        for flow in self.flows.values_mut() {
            if let Err(e) = flow.settle(&self.tasks) {
                failures.push((flow.id.clone(), e));
            }
        }

        let snapshot = self.upstream_snapshot();
        for flow in self.flows.values_mut() {
            if let Err(e) = flow.step_run(&mut self.tasks, &snapshot, &self.context.registry) {
                warn!(flow_id = %flow.id, error = %e, "Flow step failed");
                failures.push((flow.id.clone(), e));
            }
        }

        failures
    }

    /// Flow ids carrying `tag`, sorted
    pub fn get_flow_id_by_tag(&self, tag: &str) -> Vec<FlowId> {
        self.tag_index
            .get(tag)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Look up a flow
    pub fn get_flow(&self, flow_id: &FlowId) -> Option<&Flow> {
        self.flows.get(flow_id)
    }

    /// Look up a task
    pub fn get_task(&self, task_id: &TaskId) -> Option<&Task> {
        self.tasks.get(task_id)
    }

    /// Every flow, ordered by id
    pub fn flows(&self) -> impl Iterator<Item = &Flow> {
        self.flows.values()
    }

    /// Every task, ordered by id
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    /// Number of flows
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    /// Whether the graph holds no flow
    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Final status of a removed flow
    pub fn removed_status(&self, flow_id: &FlowId) -> Option<FlowStatus> {
        self.removed.get(flow_id).copied()
    }

    /// Whether every flow (with `tag`, if given) is terminal
    pub fn all_terminal(&self, tag: Option<&str>) -> bool {
        match tag {
            Some(tag) => self
                .get_flow_id_by_tag(tag)
                .iter()
                .filter_map(|id| self.flows.get(id))
                .all(|f| f.status().is_terminal()),
            None => self.flows.values().all(|f| f.status().is_terminal()),
        }
    }

    fn flow_mut(&mut self, flow_id: &FlowId) -> Result<&mut Flow, CoreError> {
        self.flows
            .get_mut(flow_id)
            .ok_or_else(|| CoreError::FlowNotFound(flow_id.to_string()))
    }

    /// Stop one flow
    pub fn stop_flow(&mut self, flow_id: &FlowId) -> Result<(), CoreError> {
        let flow = self
            .flows
            .get_mut(flow_id)
            .ok_or_else(|| CoreError::FlowNotFound(flow_id.to_string()))?;
        flow.stop_flow(&mut self.tasks)
    }

    /// Suspend one flow
    pub fn suspend_flow(&mut self, flow_id: &FlowId) -> Result<(), CoreError> {
        let flow = self
            .flows
            .get_mut(flow_id)
            .ok_or_else(|| CoreError::FlowNotFound(flow_id.to_string()))?;
        flow.suspend_flow(&mut self.tasks)
    }

    /// Resume one flow
    pub fn resume_flow(&mut self, flow_id: &FlowId) -> Result<(), CoreError> {
        let flow = self
            .flows
            .get_mut(flow_id)
            .ok_or_else(|| CoreError::FlowNotFound(flow_id.to_string()))?;
        flow.resume_flow(&mut self.tasks)
    }

    /// Record an error on one flow
    pub fn set_flow_error(
        &mut self,
        flow_id: &FlowId,
        message: &str,
        is_fatal: bool,
    ) -> Result<(), CoreError> {
        self.flow_mut(flow_id)?.set_error(message, is_fatal)
    }

    /// Set a property on one flow
    pub fn set_flow_property(
        &mut self,
        flow_id: &FlowId,
        key: &str,
        value: &str,
    ) -> Result<(), CoreError> {
        self.flow_mut(flow_id)?.set_property(key, value);
        Ok(())
    }

    /// Tag a flow
    pub fn add_tag(&mut self, flow_id: &FlowId, tag: &str) -> Result<(), CoreError> {
        self.flow_mut(flow_id)?.tags.insert(tag.to_string());
        self.tag_index
            .entry(tag.to_string())
            .or_default()
            .insert(flow_id.clone());
        Ok(())
    }

    /// Stop every non-terminal flow, returning how many were asked to stop
    pub fn stop_all(&mut self) -> usize {
        let mut stopped = 0;
        for flow in self.flows.values_mut() {
            if matches!(flow.status(), FlowStatus::Stopping) || flow.status().is_terminal() {
                continue;
            }
            match flow.stop_flow(&mut self.tasks) {
                Ok(()) => stopped += 1,
                Err(e) => debug!(flow_id = %flow.id, error = %e, "Flow not stoppable"),
            }
        }
        stopped
    }

    /// Apply a task status reported by the workers
    pub fn report_task_status(
        &mut self,
        task_id: &TaskId,
        status: TaskStatus,
    ) -> Result<(), CoreError> {
        self.tasks
            .get_mut(task_id)
            .ok_or_else(|| CoreError::TaskNotFound(task_id.to_string()))?
            .report(status)
    }

    /// Remove a flow, optionally dropping its tasks
    ///
    /// A terminal flow's final status is kept in the completion cache for
    /// `pass_before` dependencies.
    pub fn remove_flow(&mut self, flow_id: &FlowId, clear_tasks: bool) -> Result<Flow, CoreError> {
        let mut flow = self
            .flows
            .remove(flow_id)
            .ok_or_else(|| CoreError::FlowNotFound(flow_id.to_string()))?;

        for tag in &flow.tags {
            if let Some(ids) = self.tag_index.get_mut(tag) {
                ids.remove(flow_id);
                if ids.is_empty() {
                    self.tag_index.remove(tag);
                }
            }
        }
        if clear_tasks {
            for task_id in &flow.task_ids {
                self.tasks.remove(task_id);
            }
        }
        if flow.status().is_terminal() {
            self.removed.insert(flow_id.clone(), flow.status());
        }

        self.events.extend(flow.take_events());
        self.events.push(Box::new(FlowRemoved {
            flow_id: flow_id.clone(),
            final_status: flow.status(),
            tasks_cleared: clear_tasks,
            timestamp: Utc::now(),
        }));
        info!(flow_id = %flow_id, status = %flow.status(), clear_tasks, "Removed flow");
        Ok(flow)
    }

    /// Remove expired terminal flows no live flow waits on
    pub fn cleanup(&mut self, now: DateTime<Utc>, retention: chrono::Duration) -> Vec<FlowId> {
        let still_needed: BTreeSet<FlowId> = self
            .flows
            .values()
            .filter(|f| !f.status().is_terminal())
            .flat_map(|f| f.upstreams.iter().map(|u| u.flow_id.clone()))
            .collect();

        let expired: Vec<FlowId> = self
            .flows
            .values()
            .filter(|f| f.is_expired(now, retention) && !still_needed.contains(&f.id))
            .map(|f| f.id.clone())
            .collect();

        for id in &expired {
            if let Err(e) = self.remove_flow(id, true) {
                warn!(flow_id = %id, error = %e, "Cleanup failed to remove flow");
            }
        }
        expired
    }

    /// Flow counts per status name
    pub fn status_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for flow in self.flows.values() {
            *counts.entry(flow.status().as_str().to_string()).or_insert(0) += 1;
        }
        counts
    }

    /// Introspection summaries, ordered by flow id
    pub fn summaries(&self) -> Vec<FlowSummary> {
        self.flows
            .values()
            .map(|f| FlowSummary {
                id: f.id.clone(),
                graph_id: f.graph_id.clone(),
                name: f.name.clone(),
                status: f.status(),
                tags: f.tags.iter().cloned().collect(),
                upstreams: f
                    .upstreams
                    .iter()
                    .map(|u| (u.flow_id.clone(), u.wait_mask.to_string()))
                    .collect(),
                task_count: f.task_ids.len(),
                last_error: f.last_error().map(|e| e.message.clone()),
            })
            .collect()
    }

    /// Graphviz rendering of the dependency graph
    pub fn get_dot_string(&self, fill_tasks: bool) -> String {
        let mut out = String::from("digraph flow_graph {\n  rankdir=LR;\n");
        for flow in self.flows.values() {
            let _ = writeln!(
                out,
                "  \"{}\" [label=\"{} {}\\n{}\"];",
                flow.id,
                flow.id,
                flow.name,
                flow.status()
            );
            if fill_tasks {
                for task_id in &flow.task_ids {
                    if let Some(task) = self.tasks.get(task_id) {
                        let _ = writeln!(
                            out,
                            "  \"{}\" [shape=box, label=\"{} ({})\\n{}\"];",
                            task.id, task.name, task.kind, task.status
                        );
                        let _ = writeln!(out, "  \"{}\" -> \"{}\" [style=dotted];", flow.id, task.id);
                    }
                }
            }
        }
        for flow in self.flows.values() {
            for upstream in &flow.upstreams {
                let style = if self.flows.contains_key(&upstream.flow_id) {
                    ""
                } else {
                    ", style=dashed"
                };
                let _ = writeln!(
                    out,
                    "  \"{}\" -> \"{}\" [label=\"{}\"{}];",
                    upstream.flow_id, flow.id, upstream.wait_mask, style
                );
            }
        }
        out.push_str("}\n");
        out
    }

    /// Drain domain events of the graph and its flows
    pub fn take_events(&mut self) -> Vec<Box<dyn DomainEvent>> {
        let mut events = std::mem::take(&mut self.events);
        for flow in self.flows.values_mut() {
            events.extend(flow.take_events());
        }
        events
    }

    /// Serializable form of the graph
    pub fn snapshot(&self) -> FlowGraphSnapshot {
        FlowGraphSnapshot {
            flows: self.flows.values().cloned().collect(),
            tasks: self.tasks.values().cloned().collect(),
            removed: self.removed.clone(),
            call_graph_history: self.call_graph_history.clone(),
            next_flow_id: self.next_flow_id,
            next_graph_id: self.next_graph_id,
        }
    }

    /// Rebuild a graph, checking referential integrity
    pub fn restore(snapshot: FlowGraphSnapshot, context: GraphContext) -> Result<Self, CoreError> {
        let mut graph = FlowGraph::new(context);

        for task in snapshot.tasks {
            graph.context.registry.get(&task.kind).map_err(|e| {
                CoreError::RecoveryError(format!("task {}: {}", task.id, e))
            })?;
            if graph.tasks.insert(task.id.clone(), task).is_some() {
                return Err(CoreError::RecoveryError("duplicate task id".to_string()));
            }
        }

        for flow in snapshot.flows {
            for task_id in &flow.task_ids {
                match graph.tasks.get(task_id) {
                    Some(task) if task.flow_id == flow.id => {}
                    Some(task) => {
                        return Err(CoreError::RecoveryError(format!(
                            "task {} belongs to flow {}, listed by flow {}",
                            task_id, task.flow_id, flow.id
                        )))
                    }
                    None => {
                        return Err(CoreError::RecoveryError(format!(
                            "flow {} references unknown task {}",
                            flow.id, task_id
                        )))
                    }
                }
            }
            for tag in &flow.tags {
                graph
                    .tag_index
                    .entry(tag.clone())
                    .or_default()
                    .insert(flow.id.clone());
            }
            if graph.flows.insert(flow.id.clone(), flow).is_some() {
                return Err(CoreError::RecoveryError("duplicate flow id".to_string()));
            }
        }

        for task in graph.tasks.values() {
            if let Some(owner) = graph.flows.get(&task.flow_id) {
                if !owner.task_ids.contains(&task.id) {
                    return Err(CoreError::RecoveryError(format!(
                        "task {} is not listed by its flow {}",
                        task.id, owner.id
                    )));
                }
            }
        }

        graph.removed = snapshot.removed;
        graph.call_graph_history = snapshot.call_graph_history;
        graph.next_flow_id = snapshot.next_flow_id.max(1);
        graph.next_graph_id = snapshot.next_graph_id.max(1);
        Ok(graph)
    }

    /// JSON form of the graph
    pub fn serialize(&self) -> Result<String, CoreError> {
        Ok(serde_json::to_string(&self.snapshot())?)
    }

    /// Parse the JSON form of a graph
    pub fn deserialize(text: &str, context: GraphContext) -> Result<Self, CoreError> {
        let snapshot: FlowGraphSnapshot = serde_json::from_str(text)
            .map_err(|e| CoreError::RecoveryError(format!("malformed flow graph: {}", e)))?;
        Self::restore(snapshot, context)
    }
}
