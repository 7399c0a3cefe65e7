//! In-memory collaborators for the indexctl control plane
//!
//! This crate provides in-memory implementations of the collaborator
//! interfaces defined in the indexctl-core crate: the status store, the
//! checkpoint store, worker liveness tables and template loaders. It is
//! primarily useful for development, testing and single-process
//! deployments where durability is not required.

use std::sync::Arc;
use dashmap::DashMap;
use tracing::debug;

pub mod repositories;
pub use repositories::{InMemoryCheckpointStore, InMemoryLivenessTable, InMemoryStatusStore};

pub mod templates;
pub use templates::{FsTemplateLoader, InMemoryTemplateLoader};

use indexctl_core::{
    domain::collaborators::{
        CheckpointStore, MetricsSink, NoopMetricsSink, ResourcePlanner, ShortfallResourcePlanner,
        StatusStore,
    },
    domain::events::{DomainEventHandler, LoggingEventHandler},
    domain::task::GenericTaskKind,
    domain::template::{TemplateLoader, YamlTemplateInterpreter},
    BuildId, ControllerConfig, CoreError, GenerationServices, GenerationServicesFactory,
    GraphContext, TaskKindRegistry,
};

/// Task kinds the bundled templates refer to
pub fn default_task_kinds() -> TaskKindRegistry {
    TaskKindRegistry::new()
        .with_kind(Arc::new(GenericTaskKind::new("build")))
        .with_kind(Arc::new(GenericTaskKind::new("merge")))
        .with_kind(Arc::new(GenericTaskKind::new("publish").with_required_param("cluster")))
        .with_kind(Arc::new(
            GenericTaskKind::new("rollback")
                .with_required_param("cluster")
                .with_required_param("version"),
        ))
        .with_kind(Arc::new(GenericTaskKind::new("update_config")))
        .with_kind(Arc::new(GenericTaskKind::new("cleanup")))
}

/// Provider of in-memory collaborators, one liveness table per job
pub struct InMemoryStateStoreProvider {
    config: ControllerConfig,
    graph: GraphContext,
    status_store: Arc<InMemoryStatusStore>,
    checkpoint_store: Arc<InMemoryCheckpointStore>,
    liveness: DashMap<BuildId, Arc<InMemoryLivenessTable>>,
    planner: Arc<dyn ResourcePlanner>,
    metrics: Arc<dyn MetricsSink>,
    event_handler: Arc<dyn DomainEventHandler>,
}

impl InMemoryStateStoreProvider {
    /// Create a provider loading templates through `loader`
    pub fn new(config: ControllerConfig, loader: Arc<dyn TemplateLoader>) -> Self {
        let graph = GraphContext {
            registry: default_task_kinds(),
            loader,
            interpreter: Arc::new(YamlTemplateInterpreter::new()),
            template_root: config.template_root.clone(),
        };
        Self {
            config,
            graph,
            status_store: Arc::new(InMemoryStatusStore::new()),
            checkpoint_store: Arc::new(InMemoryCheckpointStore::new()),
            liveness: DashMap::new(),
            planner: Arc::new(ShortfallResourcePlanner),
            metrics: Arc::new(NoopMetricsSink),
            event_handler: Arc::new(LoggingEventHandler),
        }
    }

    /// Replace the task-kind registry
    pub fn with_registry(mut self, registry: TaskKindRegistry) -> Self {
        self.graph.registry = registry;
        self
    }

    /// Publish gauges to `metrics`
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Hand domain events to `handler`
    pub fn with_event_handler(mut self, handler: Arc<dyn DomainEventHandler>) -> Self {
        self.event_handler = handler;
        self
    }

    /// The shared status store
    pub fn store(&self) -> Arc<InMemoryStatusStore> {
        self.status_store.clone()
    }

    /// The shared checkpoint store
    pub fn checkpoints(&self) -> Arc<InMemoryCheckpointStore> {
        self.checkpoint_store.clone()
    }

    /// Liveness table of `build_id`, created on first use
    pub fn liveness(&self, build_id: &BuildId) -> Arc<InMemoryLivenessTable> {
        self.liveness
            .entry(build_id.clone())
            .or_insert_with(|| {
                debug!(build_id = %build_id, "Creating liveness table");
                Arc::new(InMemoryLivenessTable::new(
                    self.config.slow_worker_threshold() * 2,
                ))
            })
            .clone()
    }
}

impl GenerationServicesFactory for InMemoryStateStoreProvider {
    fn create(&self, build_id: &BuildId) -> Result<GenerationServices, CoreError> {
        let checkpoint_store: Arc<dyn CheckpointStore> = self.checkpoint_store.clone();
        Ok(GenerationServices {
            config: self.config.clone(),
            graph: self.graph.clone(),
            status_store: self.status_store.clone(),
            checkpoint_store,
            liveness: self.liveness(build_id),
            planner: self.planner.clone(),
            metrics: self.metrics.clone(),
            event_handler: self.event_handler.clone(),
        })
    }

    fn status_store(&self) -> Arc<dyn StatusStore> {
        self.status_store.clone()
    }
}
