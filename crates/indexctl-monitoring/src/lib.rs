//! Monitoring for the indexctl control plane.
//!
//! Logging initialization plus a `metrics`-backed implementation of the
//! controller's metrics sink.

use std::net::SocketAddr;
use tracing::info;

use indexctl_core::ControllerConfig;

pub mod logging;
pub mod metrics;

pub use crate::logging::{init_logging, LogExt};
pub use crate::metrics::MetricsRecorderSink;

/// Configuration for initializing the monitoring system
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitoringConfig {
    /// Service name used in the startup log line
    pub service_name: String,
    /// Log level filter (e.g., "info,indexctl=debug")
    pub log_filter: String,
    /// JSON instead of pretty log lines
    pub json_logs: bool,
    /// Enable metrics
    pub enable_metrics: bool,
    /// Address of the Prometheus scrape endpoint
    pub metrics_listen: Option<SocketAddr>,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            service_name: "indexctl".to_string(),
            log_filter: "info".to_string(),
            json_logs: false,
            enable_metrics: true,
            metrics_listen: None,
        }
    }
}

impl MonitoringConfig {
    /// Logging settings taken from the controller configuration
    pub fn from_controller_config(config: &ControllerConfig) -> Self {
        Self {
            log_filter: config.log_level.clone(),
            json_logs: config.json_logs,
            ..Self::default()
        }
    }

    /// Logging settings from `INDEXCTL_LOG_LEVEL` and `INDEXCTL_JSON_LOGS`
    ///
    /// Usable before any configuration file is read, so that warnings
    /// raised while loading it are not lost.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`MonitoringConfig::from_env`] over any variable source
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(value) = lookup("INDEXCTL_LOG_LEVEL") {
            config.log_filter = value;
        }
        if let Some(value) = lookup("INDEXCTL_JSON_LOGS") {
            config.json_logs = value.to_lowercase() == "true" || value == "1";
        }
        config
    }
}

/// Install the Prometheus exporter when metrics are enabled and an address is set
pub fn init_metrics(config: &MonitoringConfig) -> anyhow::Result<()> {
    if config.enable_metrics {
        if let Some(listen) = config.metrics_listen {
            crate::metrics::install_exporter(listen)?;
        }
    }
    Ok(())
}

/// Initialize monitoring system
pub fn init(config: &MonitoringConfig) -> anyhow::Result<()> {
    init_logging(config)?;
    init_metrics(config)?;

    info!(
        service_name = %config.service_name,
        metrics = config.enable_metrics,
        "Monitoring initialized"
    );
    Ok(())
}
