//! Registry of every job run by one controller process

use crate::{
    application::keeper::{GenerationKeeper, GenerationStatus},
    application::state_machine::GenerationServices,
    config::ControllerConfig,
    domain::collaborators::StatusStore,
    domain::generation::{BuildId, GenerationStep, JobKind},
    CoreError,
};
use dashmap::{mapref::entry::Entry, DashMap};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Builds the collaborators of each job
pub trait GenerationServicesFactory: Send + Sync {
    /// Collaborators for job `build_id`
    fn create(&self, build_id: &BuildId) -> Result<GenerationServices, CoreError>;

    /// The status store every job persists to
    fn status_store(&self) -> Arc<dyn StatusStore>;
}

/// Outcome of [`GenerationController::recover_all`]
#[derive(Debug, Default)]
pub struct RecoveryReport {
    /// Jobs back under control
    pub recovered: Vec<BuildId>,

    /// Jobs whose document could not be recovered
    pub failed: Vec<(BuildId, CoreError)>,
}

/// Owns one keeper per job and drives their ticks
pub struct GenerationController {
    config: ControllerConfig,
    factory: Arc<dyn GenerationServicesFactory>,
    keepers: DashMap<BuildId, Arc<GenerationKeeper>>,
}

impl std::fmt::Debug for GenerationController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationController")
            .field("config", &self.config)
            .field("jobs", &self.keepers.len())
            .finish()
    }
}

impl GenerationController {
    /// Create an empty controller
    pub fn new(config: ControllerConfig, factory: Arc<dyn GenerationServicesFactory>) -> Self {
        Self {
            config,
            factory,
            keepers: DashMap::new(),
        }
    }

    /// Controller configuration
    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Register a job without starting it
    ///
    /// An existing job that never got started is handed back as is, so a
    /// "start build" that failed to persist can simply be retried.
    pub fn create_build(
        &self,
        build_id: BuildId,
        kind: JobKind,
        config_path: &str,
        index_root: &str,
        params: BTreeMap<String, String>,
    ) -> Result<Arc<GenerationKeeper>, CoreError> {
        match self.keepers.entry(build_id.clone()) {
            Entry::Occupied(existing) => {
                if existing.get().status().started {
                    return Err(CoreError::ValidationError(format!(
                        "job {} already exists",
                        build_id
                    )));
                }
                Ok(existing.get().clone())
            }
            Entry::Vacant(slot) => {
                let services = self.factory.create(&build_id)?;
                let keeper = Arc::new(GenerationKeeper::create(
                    build_id,
                    kind,
                    config_path,
                    index_root,
                    params,
                    services,
                ));
                slot.insert(keeper.clone());
                Ok(keeper)
            }
        }
    }

    /// Register and start a job
    pub async fn start_build(
        &self,
        build_id: BuildId,
        kind: JobKind,
        config_path: &str,
        index_root: &str,
        params: BTreeMap<String, String>,
    ) -> Result<Arc<GenerationKeeper>, CoreError> {
        let keeper = self.create_build(build_id, kind, config_path, index_root, params)?;
        keeper.start_build().await?;
        Ok(keeper)
    }

    /// Keeper of `build_id`
    pub fn keeper(&self, build_id: &BuildId) -> Result<Arc<GenerationKeeper>, CoreError> {
        self.keepers
            .get(build_id)
            .map(|k| k.clone())
            .ok_or_else(|| CoreError::GenerationNotFound(build_id.to_string()))
    }

    /// Stop a job
    pub async fn stop_build(&self, build_id: &BuildId) -> Result<(), CoreError> {
        self.keeper(build_id)?.stop_build().await
    }

    /// Forget a job that is stopped and cleaned up
    pub fn remove_build(&self, build_id: &BuildId) -> Result<(), CoreError> {
        let keeper = self.keeper(build_id)?;
        if !keeper.is_finished() {
            return Err(CoreError::ValidationError(format!(
                "job {} is {}, only stopped jobs can be removed",
                build_id,
                keeper.status().step
            )));
        }
        self.keepers.remove(build_id);
        info!(build_id = %build_id, "Removed job");
        Ok(())
    }

    /// Ids of every job, sorted
    pub fn build_ids(&self) -> Vec<BuildId> {
        let mut ids: Vec<BuildId> = self.keepers.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Status views of every job, sorted by id
    pub fn statuses(&self) -> Vec<GenerationStatus> {
        let mut statuses: Vec<GenerationStatus> =
            self.keepers.iter().map(|e| e.value().status()).collect();
        statuses.sort_by(|a, b| a.build_id.cmp(&b.build_id));
        statuses
    }

    /// Rebuild every job found in the status store
    ///
    /// Each job recovers all or nothing; failures are reported and the
    /// remaining jobs still come back.
    pub async fn recover_all(&self) -> Result<RecoveryReport, CoreError> {
        let mut report = RecoveryReport::default();
        for (build_id, location) in self.factory.status_store().list().await? {
            if self.keepers.contains_key(&build_id) {
                continue;
            }
            let result = match self.factory.create(&build_id) {
                Ok(services) => GenerationKeeper::recover(&build_id, location, services).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(keeper) => {
                    if let Entry::Vacant(slot) = self.keepers.entry(build_id.clone()) {
                        slot.insert(Arc::new(keeper));
                        report.recovered.push(build_id);
                    }
                }
                Err(e) => {
                    error!(build_id = %build_id, error = %e, "Job recovery failed");
                    report.failed.push((build_id, e));
                }
            }
        }
        info!(
            recovered = report.recovered.len(),
            failed = report.failed.len(),
            "Recovery finished"
        );
        Ok(report)
    }

    /// Tick every job that is not finished, concurrently
    pub async fn tick_all(&self) -> Vec<(BuildId, CoreError)> {
        let keepers: Vec<Arc<GenerationKeeper>> = self
            .keepers
            .iter()
            .filter(|e| !e.value().is_finished())
            .map(|e| e.value().clone())
            .collect();

        let results = join_all(keepers.iter().map(|k| k.tick())).await;
        keepers
            .iter()
            .zip(results)
            .filter_map(|(k, result)| result.err().map(|e| (k.build_id().clone(), e)))
            .collect()
    }

    /// Number of jobs that are not yet STOPPED
    pub fn active_jobs(&self) -> usize {
        self.keepers
            .iter()
            .filter(|e| e.value().status().step != GenerationStep::Stopped)
            .count()
    }

    /// Tick all jobs every `tick_interval` until `shutdown` flips to true
    pub fn spawn_ticker(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let period = self.config.tick_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(period_ms = period.as_millis() as u64, "Ticker started");
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        for (build_id, e) in self.tick_all().await {
                            if e.is_retryable() {
                                debug!(build_id = %build_id, error = %e, "Tick failed, will retry");
                            } else {
                                warn!(build_id = %build_id, error = %e, "Tick failed");
                            }
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Ticker stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestWorld;

    struct WorldFactory(TestWorld);

    impl GenerationServicesFactory for WorldFactory {
        fn create(&self, _build_id: &BuildId) -> Result<GenerationServices, CoreError> {
            Ok(self.0.services())
        }

        fn status_store(&self) -> Arc<dyn StatusStore> {
            self.0.status_store.clone()
        }
    }

    fn controller() -> (GenerationController, Arc<WorldFactory>) {
        let factory = Arc::new(WorldFactory(TestWorld::new()));
        (
            GenerationController::new(ControllerConfig::default(), factory.clone()),
            factory,
        )
    }

    fn params() -> BTreeMap<String, String> {
        BTreeMap::from([("cluster".to_string(), "c1".to_string())])
    }

    #[tokio::test]
    async fn test_start_build_retry_after_persist_failure() {
        let (c, factory) = controller();
        let id = BuildId("app".into());

        factory.0.status_store.fail_next_writes(1);
        let first = c
            .start_build(id.clone(), JobKind::ServiceBuild, "", "/idx", params())
            .await;
        assert!(matches!(first, Err(CoreError::PersistError(_))));

        c.start_build(id.clone(), JobKind::ServiceBuild, "", "/idx", params())
            .await
            .unwrap();
        assert!(c.keeper(&id).unwrap().status().started);

        let again = c
            .start_build(id.clone(), JobKind::ServiceBuild, "", "/idx", params())
            .await;
        assert!(matches!(again, Err(CoreError::ValidationError(_))));
    }

    #[tokio::test]
    async fn test_concurrent_start_build_registers_one_job() {
        let (c, _factory) = controller();
        let id = BuildId("app".into());

        let (first, second) = tokio::join!(
            c.start_build(id.clone(), JobKind::ServiceBuild, "", "/idx", params()),
            c.start_build(id.clone(), JobKind::ServiceBuild, "", "/idx", params()),
        );

        let results = [first, second];
        let started: Vec<&Arc<GenerationKeeper>> =
            results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(started.len(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(CoreError::ValidationError(_)))));
        assert_eq!(c.build_ids(), vec![id.clone()]);
        assert!(Arc::ptr_eq(started[0], &c.keeper(&id).unwrap()));
    }

    #[tokio::test]
    async fn test_recover_all_and_remove() {
        let (c, factory) = controller();
        let id = BuildId("app".into());
        c.start_build(id.clone(), JobKind::OneShotJob, "", "/idx", params())
            .await
            .unwrap();
        assert!(matches!(c.remove_build(&id), Err(CoreError::ValidationError(_))));

        let fresh = GenerationController::new(ControllerConfig::default(), factory);
        let report = fresh.recover_all().await.unwrap();
        assert_eq!(report.recovered, vec![id.clone()]);
        assert!(report.failed.is_empty());
        assert_eq!(fresh.build_ids(), vec![id.clone()]);
        assert_eq!(fresh.active_jobs(), 1);

        fresh.stop_build(&id).await.unwrap();
        assert!(fresh.tick_all().await.is_empty());
        assert!(fresh.tick_all().await.is_empty());
        fresh.remove_build(&id).unwrap();
        assert!(matches!(
            fresh.keeper(&id),
            Err(CoreError::GenerationNotFound(_))
        ));
    }
}
