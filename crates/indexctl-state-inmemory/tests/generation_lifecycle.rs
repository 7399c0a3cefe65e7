use chrono::{Duration, Utc};
use indexctl_core::{
    domain::collaborators::{NodeId, StatusStore},
    domain::generation::GenerationState,
    BuildId, ControllerConfig, CoreError, FlowGraph, FlowId, FlowStatus, GenerationController,
    GenerationServicesFactory, GenerationStep, JobKind, TaskId, TaskStatus,
};
use indexctl_state_inmemory::{InMemoryStateStoreProvider, InMemoryTemplateLoader};
use pretty_assertions::assert_eq;
use std::collections::BTreeMap;
use std::sync::Arc;

const ABC: &str = r#"
flows:
  - name: a
    tasks: [{name: build, kind: build}]
  - name: b
    upstream: [{flow: a, wait: [finish]}]
    tasks: [{name: merge, kind: merge}]
  - name: c
    upstream: [{flow: a, wait: [finish, stop]}]
    tasks: [{name: publish, kind: publish, params: {cluster: "${cluster}"}}]
"#;

const SERVICE_BUILD: &str = r#"
flows:
  - name: prepare
    tags: ["cluster:${cluster}"]
    tasks: [{name: build, kind: build, params: {partition_count: "2"}}]
  - name: serve
    upstream: [{flow: prepare}]
    tasks: [{name: publish, kind: publish, params: {cluster: "${cluster}"}}]
"#;

const SINGLE: &str = "flows:\n  - name: work\n    tasks: [{name: build, kind: build}]\n";
const TEARDOWN: &str = "flows:\n  - name: teardown\n    tasks: [{name: cleanup, kind: cleanup}]\n";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("indexctl=debug")
        .with_test_writer()
        .try_init();
}

fn provider(config: ControllerConfig) -> Arc<InMemoryStateStoreProvider> {
    init_tracing();
    let loader = InMemoryTemplateLoader::new()
        .with_template("abc.yaml", ABC)
        .with_template("service_build.yaml", SERVICE_BUILD)
        .with_template("one_shot_job.yaml", SINGLE)
        .with_template("general_task.yaml", "flows: []\n")
        .with_template("teardown.yaml", TEARDOWN)
        .with_template("single.yaml", SINGLE);
    Arc::new(InMemoryStateStoreProvider::new(config, Arc::new(loader)))
}

fn controller(provider: &Arc<InMemoryStateStoreProvider>) -> GenerationController {
    GenerationController::new(ControllerConfig::default(), provider.clone())
}

fn params() -> BTreeMap<String, String> {
    BTreeMap::from([("cluster".to_string(), "c1".to_string())])
}

fn statuses(summaries: &[indexctl_core::FlowSummary]) -> Vec<(String, FlowStatus)> {
    summaries
        .iter()
        .map(|s| (s.name.clone(), s.status))
        .collect()
}

#[tokio::test]
async fn test_downstream_flows_start_when_upstream_finishes() -> Result<(), CoreError> {
    let provider = provider(ControllerConfig::default());
    let c = controller(&provider);
    let id = BuildId("abc".into());
    let keeper = c
        .start_build(id, JobKind::CustomGraph, "abc.yaml", "/idx/abc", params())
        .await?;

    keeper.tick().await?;
    assert_eq!(
        statuses(&keeper.flow_summaries().await),
        vec![
            ("a".to_string(), FlowStatus::Running),
            ("b".to_string(), FlowStatus::Init),
            ("c".to_string(), FlowStatus::Init),
        ]
    );

    keeper
        .report_task_status(TaskId("1.build".into()), TaskStatus::Finished)
        .await?;
    keeper.tick().await?;
    assert_eq!(
        statuses(&keeper.flow_summaries().await),
        vec![
            ("a".to_string(), FlowStatus::Finish),
            ("b".to_string(), FlowStatus::Running),
            ("c".to_string(), FlowStatus::Running),
        ]
    );

    let dot = keeper.dot_string(false).await;
    assert!(dot.contains("\"1\" [label=\"1 a\\nfinish\"];"));
    assert!(dot.contains("\"1\" -> \"2\" [label=\"finish\"];"));
    assert!(dot.contains("\"1\" -> \"3\" [label=\"finish|stop\"];"));
    Ok(())
}

#[tokio::test]
async fn test_stop_flow_waits_for_worker_report() -> Result<(), CoreError> {
    let provider = provider(ControllerConfig::default());
    let c = controller(&provider);
    let id = BuildId("general".into());
    let keeper = c
        .start_build(id.clone(), JobKind::GeneralTask, "", "/idx/general", params())
        .await?;
    let flows = keeper
        .start_task("reindex".into(), "single.yaml".into(), BTreeMap::new())
        .await?;
    assert_eq!(flows, vec![FlowId("1".into())]);

    keeper.tick().await?;
    assert_eq!(keeper.status().step, GenerationStep::Started);

    keeper.stop_flow(FlowId("1".into())).await?;
    assert_eq!(keeper.flow_summaries().await[0].status, FlowStatus::Stopping);

    keeper.tick().await?;
    assert_eq!(keeper.flow_summaries().await[0].status, FlowStatus::Stopping);

    provider.liveness(&id).heartbeat(
        NodeId("worker-1".into()),
        TaskId("1.build".into()),
        Some(TaskStatus::Stopped),
        Utc::now(),
    );
    keeper.tick().await?;
    assert_eq!(keeper.flow_summaries().await[0].status, FlowStatus::Stopped);

    // eligible for the cleanup pass once the retention has passed
    let state = keeper.state().await;
    let mut graph = FlowGraph::restore(state.flow_graph, provider.create(&id)?.graph)?;
    let removed = graph.cleanup(Utc::now() + Duration::seconds(601), Duration::seconds(600));
    assert_eq!(removed, vec![FlowId("1".into())]);
    assert_eq!(graph.removed_status(&FlowId("1".into())), Some(FlowStatus::Stopped));
    Ok(())
}

#[tokio::test]
async fn test_cleanup_pass_runs_inside_tick() -> Result<(), CoreError> {
    let provider = provider(ControllerConfig {
        flow_retention_secs: 0,
        ..ControllerConfig::default()
    });
    let c = controller(&provider);
    let id = BuildId("general".into());
    let keeper = c
        .start_build(id.clone(), JobKind::GeneralTask, "", "/idx/general", params())
        .await?;
    keeper
        .start_task("reindex".into(), "single.yaml".into(), BTreeMap::new())
        .await?;
    keeper.tick().await?;

    keeper.stop_task("reindex".into()).await?;
    provider.liveness(&id).heartbeat(
        NodeId("worker-1".into()),
        TaskId("1.build".into()),
        Some(TaskStatus::Stopped),
        Utc::now(),
    );
    keeper.tick().await?;

    assert!(keeper.flow_summaries().await.is_empty());
    let state = keeper.state().await;
    assert_eq!(
        state.flow_graph.removed.get(&FlowId("1".into())),
        Some(&FlowStatus::Stopped)
    );
    assert!(state.flow_graph.tasks.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_persist_failure_during_start_build() -> Result<(), CoreError> {
    let provider = provider(ControllerConfig::default());
    let c = controller(&provider);
    let id = BuildId("svc".into());

    let keeper = c.create_build(id.clone(), JobKind::ServiceBuild, "", "/idx/svc", params())?;
    let before = keeper.status();

    provider.store().fail_next_writes(1);
    let result = c
        .start_build(id.clone(), JobKind::ServiceBuild, "", "/idx/svc", params())
        .await;
    assert!(matches!(result, Err(CoreError::PersistError(_))));

    let after = keeper.status();
    assert_eq!(after.step, before.step);
    assert_eq!(after.started, before.started);
    assert_eq!(after.flow_counts, before.flow_counts);
    assert_eq!(after.fatal_error, before.fatal_error);
    assert!(keeper.state().await.flow_graph.flows.is_empty());

    c.start_build(id.clone(), JobKind::ServiceBuild, "", "/idx/svc", params())
        .await?;
    let stored = provider.store().read(&id).await?.expect("live status document");
    let state: GenerationState = serde_json::from_slice(&stored)?;
    assert_eq!(state.meta.step, GenerationStep::Starting);
    assert!(state.meta.started);
    assert_eq!(state.flow_graph.flows.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_failed_command_changes_nothing() -> Result<(), CoreError> {
    let provider = provider(ControllerConfig::default());
    let c = controller(&provider);
    let id = BuildId("svc".into());
    let keeper = c
        .start_build(id.clone(), JobKind::ServiceBuild, "", "/idx/svc", params())
        .await?;
    keeper.tick().await?;

    let writes = provider.store().writes();
    let before = serde_json::to_string(&keeper.state().await)?;

    let result = keeper
        .rollback("c1".into(), indexctl_core::RollbackTarget::Version(7))
        .await;
    assert!(matches!(result, Err(CoreError::ValidationError(_))));
    let result = keeper
        .call_graph("broken".into(), "missing.yaml".into(), BTreeMap::new())
        .await;
    assert!(matches!(result, Err(CoreError::TemplateError(_))));

    assert_eq!(provider.store().writes(), writes);
    assert_eq!(serde_json::to_string(&keeper.state().await)?, before);
    Ok(())
}

#[tokio::test]
async fn test_call_graph_is_idempotent_across_recovery() -> Result<(), CoreError> {
    let provider = provider(ControllerConfig::default());
    let c = controller(&provider);
    let id = BuildId("svc".into());
    let keeper = c
        .start_build(id.clone(), JobKind::ServiceBuild, "", "/idx/svc", params())
        .await?;

    let first = keeper
        .call_graph("featureX".into(), "single.yaml".into(), BTreeMap::new())
        .await?;
    let second = keeper
        .call_graph("featureX".into(), "single.yaml".into(), BTreeMap::new())
        .await?;
    assert_eq!(first.len(), 1);
    assert!(second.is_empty());
    assert_eq!(keeper.flow_summaries().await.len(), 3);

    let fresh = controller(&provider);
    fresh.recover_all().await?;
    let recovered = fresh.keeper(&id)?;
    let again = recovered
        .call_graph("featureX".into(), "single.yaml".into(), BTreeMap::new())
        .await?;
    assert!(again.is_empty());
    assert_eq!(recovered.flow_summaries().await.len(), 3);
    Ok(())
}

#[tokio::test]
async fn test_recovery_reproduces_state() -> Result<(), CoreError> {
    let provider = provider(ControllerConfig::default());
    let c = controller(&provider);
    let id = BuildId("svc".into());
    let keeper = c
        .start_build(id.clone(), JobKind::ServiceBuild, "", "/idx/svc", params())
        .await?;
    keeper.tick().await?;
    keeper.commit_version("c1".into(), 4).await?;
    let checkpoint = keeper.mark_checkpoint("c1".into(), 4).await?;
    keeper.create_savepoint("c1".into(), checkpoint).await?;

    let fresh = controller(&provider);
    let report = fresh.recover_all().await?;
    assert_eq!(report.recovered, vec![id.clone()]);

    let recovered = fresh.keeper(&id)?;
    assert_eq!(
        serde_json::to_string(&recovered.state().await)?,
        serde_json::to_string(&keeper.state().await)?
    );
    assert_eq!(recovered.status().step, GenerationStep::Starting);
    Ok(())
}

#[tokio::test]
async fn test_compressed_status_document_recovers() -> Result<(), CoreError> {
    let provider = provider(ControllerConfig {
        compress_threshold_bytes: 16,
        ..ControllerConfig::default()
    });
    let c = controller(&provider);
    let id = BuildId("svc".into());
    c.start_build(id.clone(), JobKind::ServiceBuild, "", "/idx/svc", params())
        .await?;

    let stored = provider.store().read(&id).await?.expect("live status document");
    assert!(serde_json::from_slice::<serde_json::Value>(&stored).is_err());

    let fresh = controller(&provider);
    let report = fresh.recover_all().await?;
    assert_eq!(report.recovered, vec![id.clone()]);
    assert_eq!(fresh.keeper(&id)?.flow_summaries().await.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_stopped_job_recovers_from_marker() -> Result<(), CoreError> {
    let provider = provider(ControllerConfig::default());
    let c = controller(&provider);
    let id = BuildId("once".into());
    let keeper = c
        .start_build(id.clone(), JobKind::OneShotJob, "", "/idx/once", params())
        .await?;
    keeper.tick().await?;
    keeper
        .report_task_status(TaskId("1.build".into()), TaskStatus::Finished)
        .await?;
    assert!(c.tick_all().await.is_empty());
    assert_eq!(keeper.status().step, GenerationStep::Stopped);
    assert!(c.tick_all().await.is_empty());
    assert!(keeper.is_finished());
    assert!(provider.store().read(&id).await?.is_none());

    let fresh = controller(&provider);
    fresh.recover_all().await?;
    let recovered = fresh.keeper(&id)?;
    assert!(recovered.is_finished());
    assert_eq!(recovered.status().step, GenerationStep::Stopped);
    assert_eq!(fresh.active_jobs(), 0);
    Ok(())
}

#[tokio::test]
async fn test_fatal_flow_stops_job() -> Result<(), CoreError> {
    let provider = provider(ControllerConfig {
        auto_stop_on_fatal: true,
        ..ControllerConfig::default()
    });
    let c = controller(&provider);
    let id = BuildId("svc".into());
    let keeper = c
        .start_build(id.clone(), JobKind::ServiceBuild, "", "/idx/svc", params())
        .await?;
    keeper.tick().await?;

    keeper
        .report_flow_error(FlowId("1".into()), "index shard corrupted".into(), true)
        .await?;
    let fatal = keeper.fatal_error().expect("fatal error recorded");
    assert_eq!(fatal.flow_id, FlowId("1".into()));
    assert_eq!(keeper.status().step, GenerationStep::Stopping);

    // the teardown flow still has to run before the job is stopped
    keeper.tick().await?;
    let teardown = keeper
        .flow_summaries()
        .await
        .into_iter()
        .find(|f| f.name == "teardown")
        .expect("teardown flow loaded");
    assert_eq!(teardown.status, FlowStatus::Running);

    keeper
        .report_task_status(TaskId(format!("{}.cleanup", teardown.id)), TaskStatus::Finished)
        .await?;
    keeper.tick().await?;
    assert_eq!(keeper.status().step, GenerationStep::Stopped);
    assert_eq!(keeper.fatal_error(), Some(fatal));
    Ok(())
}

#[tokio::test]
async fn test_worker_plan_requests_missing_workers() -> Result<(), CoreError> {
    let provider = provider(ControllerConfig::default());
    let c = controller(&provider);
    let id = BuildId("svc".into());
    let keeper = c
        .start_build(id.clone(), JobKind::ServiceBuild, "", "/idx/svc", params())
        .await?;
    provider.liveness(&id).heartbeat(
        NodeId("worker-1".into()),
        TaskId("1.build".into()),
        None,
        Utc::now(),
    );
    keeper.tick().await?;

    let plan = keeper.worker_plan();
    let task = TaskId("1.build".into());
    assert_eq!(plan.assignments[&task].nodes, vec![NodeId("worker-1".into())]);
    assert_eq!(plan.resource_plan.requests.get(&task), Some(&1));
    assert!(plan.slow_nodes.is_empty());
    assert_eq!(provider.liveness(&id).target(&task), Some(plan.assignments[&task].clone()));
    Ok(())
}
