//! Control-plane process for indexctl
//!
//! Wires the controller to the in-memory collaborators, starts the
//! configured jobs and ticks them until shutdown.

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{error, info, warn};

use indexctl_core::{BuildId, CoreError, GenerationController, GenerationStep};
use indexctl_monitoring::{LogExt, MetricsRecorderSink};
use indexctl_state_inmemory::{FsTemplateLoader, InMemoryStateStoreProvider};

pub mod config;

pub use config::{JobSpec, ServerConfig};

/// Controller backed by in-memory stores and templates read from disk
pub fn build_controller(config: &ServerConfig) -> Arc<GenerationController> {
    let provider = InMemoryStateStoreProvider::new(
        config.controller.clone(),
        Arc::new(FsTemplateLoader::new()),
    )
    .with_metrics(Arc::new(MetricsRecorderSink::new()));

    Arc::new(GenerationController::new(
        config.controller.clone(),
        Arc::new(provider),
    ))
}

/// Outcome of [`start_jobs`]
#[derive(Debug, Default)]
pub struct StartReport {
    /// Jobs started by this call
    pub started: Vec<BuildId>,

    /// Jobs already under control, typically recovered from the status store
    pub skipped: Vec<BuildId>,

    /// Jobs that failed to start
    pub failed: Vec<(BuildId, CoreError)>,
}

/// Start every configured job
///
/// Jobs the controller already knows are left alone; a job that fails to
/// start is logged and skipped.
pub async fn start_jobs(controller: &GenerationController, jobs: &[JobSpec]) -> StartReport {
    let mut report = StartReport::default();
    let known = controller.build_ids();
    for job in jobs {
        let build_id = job.build_id();
        if known.contains(&build_id) {
            info!(build_id = %build_id, "Job already under control, not starting it again");
            report.skipped.push(build_id);
            continue;
        }
        match controller
            .start_build(
                build_id.clone(),
                job.kind,
                &job.config_path,
                &job.index_root,
                job.params.clone(),
            )
            .await
        {
            Ok(_) => {
                info!(build_id = %build_id, kind = %job.kind, "Job started");
                report.started.push(build_id);
            }
            Err(e) => {
                error!(build_id = %build_id, kind = %job.kind, error = %e, "Job failed to start");
                report.failed.push((build_id, e));
            }
        }
    }
    report
}

/// Run until `shutdown` completes
pub async fn run_until<S>(config: ServerConfig, shutdown: S) -> anyhow::Result<Arc<GenerationController>>
where
    S: Future<Output = ()>,
{
    let controller = build_controller(&config);

    let report = controller
        .recover_all()
        .await
        .log_err("Failed to list stored jobs")
        .context("Failed to list stored jobs")?;
    for (build_id, e) in &report.failed {
        warn!(build_id = %build_id, error = %e, "Job could not be recovered");
    }
    info!(recovered = report.recovered.len(), "Recovery finished");

    let started = start_jobs(&controller, &config.jobs).await;
    info!(
        started = started.started.len(),
        skipped = started.skipped.len(),
        failed = started.failed.len(),
        "Configured jobs processed"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ticker = controller.clone().spawn_ticker(shutdown_rx);

    shutdown.await;
    info!("Shutting down");
    let _ = shutdown_tx.send(true);
    ticker.await.context("Ticker task failed")?;

    for status in controller.statuses() {
        if status.step != GenerationStep::Stopped {
            info!(build_id = %status.build_id, step = %status.step, "Job left running");
        }
    }
    Ok(controller)
}

/// Run until ctrl-c
pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    run_until(config, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
        }
    })
    .await?;
    Ok(())
}
