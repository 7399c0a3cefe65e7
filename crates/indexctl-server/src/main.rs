use anyhow::{Context, Result};
use indexctl_monitoring::{LogExt, MonitoringConfig};
use indexctl_server::config::ServerConfig;
use tracing::warn;

#[tokio::main]
async fn main() -> Result<()> {
    // Logging first, so warnings raised while loading the configuration are kept
    let early = MonitoringConfig::from_env();
    indexctl_monitoring::init_logging(&early).context("Failed to initialize logging")?;

    // Load configuration from the config file and environment variables
    let config = ServerConfig::load()
        .log_err("Failed to load configuration")
        .context("Failed to load configuration")?;

    let monitoring_config = MonitoringConfig {
        service_name: "indexctl".to_string(),
        metrics_listen: config.metrics_listen,
        ..MonitoringConfig::from_controller_config(&config.controller)
    };
    if monitoring_config.log_filter != early.log_filter
        || monitoring_config.json_logs != early.json_logs
    {
        warn!(
            log_filter = %early.log_filter,
            "Log settings from the configuration file are ignored, use INDEXCTL_LOG_LEVEL and INDEXCTL_JSON_LOGS"
        );
    }
    indexctl_monitoring::init_metrics(&monitoring_config).context("Failed to initialize metrics")?;

    indexctl_server::run(config).await.context("Controller error")?;

    Ok(())
}
