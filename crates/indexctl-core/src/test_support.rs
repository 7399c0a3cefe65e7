//! Fakes shared by the unit tests of this crate

use crate::application::state_machine::GenerationServices;
use crate::config::ControllerConfig;
use crate::domain::collaborators::{
    CheckpointInfo, CheckpointStore, MetricsSink, ShortfallResourcePlanner, StatusLocation,
    StatusStore, TargetAssignment, WorkerLivenessTable, WorkerNode,
};
use crate::domain::events::LoggingEventHandler;
use crate::domain::flow_graph::GraphContext;
use crate::domain::generation::BuildId;
use crate::domain::task::{GenericTaskKind, TaskId, TaskKindRegistry};
use crate::domain::template::{TemplateLoader, YamlTemplateInterpreter};
use crate::CoreError;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

/// Templates held in memory, keyed by file name
#[derive(Debug, Default)]
pub struct MapTemplateLoader {
    templates: HashMap<String, String>,
}

impl TemplateLoader for MapTemplateLoader {
    fn load(&self, _root: &str, file: &str) -> Result<String, CoreError> {
        self.templates
            .get(file)
            .cloned()
            .ok_or_else(|| CoreError::TemplateError(format!("template not found: {}", file)))
    }
}

pub fn graph_context(templates: &[(&str, &str)]) -> GraphContext {
    let loader = MapTemplateLoader {
        templates: templates
            .iter()
            .map(|(name, text)| (name.to_string(), text.to_string()))
            .collect(),
    };
    GraphContext {
        registry: TaskKindRegistry::new().with_kind(Arc::new(GenericTaskKind::new("build"))),
        loader: Arc::new(loader),
        interpreter: Arc::new(YamlTemplateInterpreter::new()),
        template_root: "templates".to_string(),
    }
}

#[derive(Debug, Default)]
struct StatusDocs {
    live: BTreeMap<BuildId, Vec<u8>>,
    stopped: BTreeMap<BuildId, Vec<u8>>,
    writes: usize,
    failures_left: usize,
}

/// Status store with write-failure injection
#[derive(Debug, Default)]
pub struct MemoryStatusStore {
    docs: Mutex<StatusDocs>,
}

impl MemoryStatusStore {
    pub fn fail_next_writes(&self, n: usize) {
        self.docs.lock().unwrap().failures_left = n;
    }

    pub fn writes(&self) -> usize {
        self.docs.lock().unwrap().writes
    }

    pub fn live(&self, build_id: &BuildId) -> Option<Vec<u8>> {
        self.docs.lock().unwrap().live.get(build_id).cloned()
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn write(&self, build_id: &BuildId, bytes: Vec<u8>) -> Result<(), CoreError> {
        let mut docs = self.docs.lock().unwrap();
        if docs.failures_left > 0 {
            docs.failures_left -= 1;
            return Err(CoreError::ExternalDependencyError("injected write failure".to_string()));
        }
        docs.writes += 1;
        docs.live.insert(build_id.clone(), bytes);
        Ok(())
    }

    async fn read(&self, build_id: &BuildId) -> Result<Option<Vec<u8>>, CoreError> {
        Ok(self.live(build_id))
    }

    async fn move_to_stopped(&self, build_id: &BuildId) -> Result<(), CoreError> {
        let mut docs = self.docs.lock().unwrap();
        if let Some(doc) = docs.live.remove(build_id) {
            docs.stopped.insert(build_id.clone(), doc);
        }
        Ok(())
    }

    async fn read_stopped(&self, build_id: &BuildId) -> Result<Option<Vec<u8>>, CoreError> {
        Ok(self.docs.lock().unwrap().stopped.get(build_id).cloned())
    }

    async fn list(&self) -> Result<Vec<(BuildId, StatusLocation)>, CoreError> {
        let docs = self.docs.lock().unwrap();
        Ok(docs
            .live
            .keys()
            .map(|id| (id.clone(), StatusLocation::Live))
            .chain(docs.stopped.keys().map(|id| (id.clone(), StatusLocation::Stopped)))
            .collect())
    }
}

#[derive(Debug, Default)]
struct Checkpoints {
    next_id: u64,
    checkpoints: BTreeMap<String, Vec<CheckpointInfo>>,
    committed: BTreeMap<String, Vec<u64>>,
}

#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    inner: Mutex<Checkpoints>,
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn mark_checkpoint(&self, cluster: &str, version: u64) -> Result<u64, CoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let checkpoint_id = inner.next_id;
        inner
            .checkpoints
            .entry(cluster.to_string())
            .or_default()
            .push(CheckpointInfo {
                checkpoint_id,
                version,
                savepoint: false,
            });
        Ok(checkpoint_id)
    }

    async fn create_savepoint(&self, cluster: &str, checkpoint_id: u64) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().unwrap();
        for c in inner.checkpoints.entry(cluster.to_string()).or_default() {
            if c.checkpoint_id == checkpoint_id {
                c.savepoint = true;
            }
        }
        Ok(())
    }

    async fn remove_savepoint(&self, cluster: &str, checkpoint_id: u64) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().unwrap();
        for c in inner.checkpoints.entry(cluster.to_string()).or_default() {
            if c.checkpoint_id == checkpoint_id {
                c.savepoint = false;
            }
        }
        Ok(())
    }

    async fn list_checkpoint(&self, cluster: &str) -> Result<Vec<CheckpointInfo>, CoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .checkpoints
            .get(cluster)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_committed_versions(&self, cluster: &str) -> Result<Vec<u64>, CoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .committed
            .get(cluster)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_reserved_versions(&self, cluster: &str) -> Result<Vec<u64>, CoreError> {
        Ok(self
            .list_checkpoint(cluster)
            .await?
            .into_iter()
            .filter(|c| c.savepoint)
            .map(|c| c.version)
            .collect())
    }

    async fn commit_version(&self, cluster: &str, version: u64) -> Result<(), CoreError> {
        self.inner
            .lock()
            .unwrap()
            .committed
            .entry(cluster.to_string())
            .or_default()
            .push(version);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct FakeLiveness {
    nodes: Mutex<Vec<WorkerNode>>,
    targets: Mutex<BTreeMap<TaskId, TargetAssignment>>,
}

impl FakeLiveness {
    pub fn upsert(&self, node: WorkerNode) {
        let mut nodes = self.nodes.lock().unwrap();
        nodes.retain(|n| n.id != node.id);
        nodes.push(node);
    }

    pub fn target(&self, task_id: &TaskId) -> Option<TargetAssignment> {
        self.targets.lock().unwrap().get(task_id).cloned()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.lock().unwrap().len()
    }
}

impl WorkerLivenessTable for FakeLiveness {
    fn get_worker_nodes(&self, task_id: &TaskId) -> Vec<WorkerNode> {
        self.nodes
            .lock()
            .unwrap()
            .iter()
            .filter(|n| &n.task_id == task_id)
            .cloned()
            .collect()
    }

    fn for_each_active_node(&self, f: &mut dyn FnMut(&WorkerNode)) {
        for node in self.nodes.lock().unwrap().iter().filter(|n| n.alive) {
            f(node);
        }
    }

    fn clear_all_nodes(&self) {
        self.nodes.lock().unwrap().clear();
    }

    fn sync_nodes_status(&self) -> Result<(), CoreError> {
        Ok(())
    }

    fn set_target(&self, target: TargetAssignment) {
        self.targets
            .lock()
            .unwrap()
            .insert(target.task_id.clone(), target);
    }
}

#[derive(Debug, Default)]
pub struct RecordingMetrics {
    gauges: Mutex<Vec<(String, f64)>>,
}

impl RecordingMetrics {
    pub fn last(&self, name: &str) -> Option<f64> {
        self.gauges
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
    }
}

impl MetricsSink for RecordingMetrics {
    fn gauge(&self, name: &str, value: f64, _labels: &[(&str, String)]) {
        self.gauges.lock().unwrap().push((name.to_string(), value));
    }

    fn increment(&self, name: &str, _labels: &[(&str, String)]) {
        self.gauges.lock().unwrap().push((name.to_string(), 1.0));
    }
}

pub const SERVICE_BUILD: &str = r#"
flows:
  - name: prepare
    tags: ["cluster:${cluster}"]
    tasks: [{name: build, kind: build}]
  - name: serve
    upstream: [{flow: prepare}]
    tasks: [{name: build, kind: build}]
"#;

pub const ONE_FLOW: &str = "flows:\n  - name: work\n    tasks: [{name: build, kind: build}]\n";

pub const ROLLBACK: &str = r#"
flows:
  - name: rollback
    properties: {version: "${version}"}
    tasks: [{name: build, kind: build, params: {cluster: "${cluster}"}}]
"#;

/// Collaborators of a job under test
pub struct TestWorld {
    pub status_store: Arc<MemoryStatusStore>,
    pub checkpoints: Arc<MemoryCheckpointStore>,
    pub liveness: Arc<FakeLiveness>,
    pub metrics: Arc<RecordingMetrics>,
    pub config: ControllerConfig,
}

impl TestWorld {
    pub fn new() -> Self {
        Self {
            status_store: Arc::new(MemoryStatusStore::default()),
            checkpoints: Arc::new(MemoryCheckpointStore::default()),
            liveness: Arc::new(FakeLiveness::default()),
            metrics: Arc::new(RecordingMetrics::default()),
            config: ControllerConfig::default(),
        }
    }

    pub fn services(&self) -> GenerationServices {
        services_with(self, self.config.clone())
    }
}

pub fn world_templates() -> GraphContext {
    graph_context(&[
        ("service_build.yaml", SERVICE_BUILD),
        ("one_shot_job.yaml", ONE_FLOW),
        ("custom.yaml", ONE_FLOW),
        ("general_task.yaml", "flows: []\n"),
        ("teardown.yaml", ONE_FLOW),
        ("sub_task.yaml", ONE_FLOW),
        ("update_config.yaml", ONE_FLOW),
        ("rollback.yaml", ROLLBACK),
    ])
}

pub fn services_with(world: &TestWorld, config: ControllerConfig) -> GenerationServices {
    GenerationServices {
        config,
        graph: world_templates(),
        status_store: world.status_store.clone(),
        checkpoint_store: world.checkpoints.clone(),
        liveness: world.liveness.clone(),
        planner: Arc::new(ShortfallResourcePlanner),
        metrics: world.metrics.clone(),
        event_handler: Arc::new(LoggingEventHandler),
    }
}

pub fn test_services() -> GenerationServices {
    TestWorld::new().services()
}
