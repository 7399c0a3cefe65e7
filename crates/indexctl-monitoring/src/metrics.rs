//! Metrics sink backed by the `metrics` facade.

use indexctl_core::domain::collaborators::MetricsSink;
use metrics::Label;
use once_cell::sync::Lazy;
use std::net::SocketAddr;
use tracing::info;

/// Gauges and counters published by the controller, with their help text
pub static CONTROLLER_METRICS: Lazy<Vec<(&'static str, &'static str)>> = Lazy::new(|| {
    vec![
        ("indexctl_flows", "Flows of a job per status"),
        ("indexctl_slow_workers", "Workers of a job behind on heartbeats"),
        ("indexctl_generation_step", "Lifecycle step of a job (0 starting .. 3 stopped)"),
        ("indexctl_persist_failures", "Status document writes that failed"),
    ]
});

/// Forwards controller gauges and counters to the installed `metrics` recorder
#[derive(Debug, Default, Clone)]
pub struct MetricsRecorderSink;

impl MetricsRecorderSink {
    /// Create a sink, describing the controller metrics to the recorder
    pub fn new() -> Self {
        for (name, help) in CONTROLLER_METRICS.iter() {
            if name.ends_with("_failures") {
                metrics::describe_counter!((*name), (*help));
            } else {
                metrics::describe_gauge!((*name), (*help));
            }
        }
        Self
    }
}

fn to_labels(labels: &[(&str, String)]) -> Vec<Label> {
    labels
        .iter()
        .map(|(key, value)| Label::new(key.to_string(), value.clone()))
        .collect()
}

impl MetricsSink for MetricsRecorderSink {
    fn gauge(&self, name: &str, value: f64, labels: &[(&str, String)]) {
        metrics::gauge!(name.to_string(), value, to_labels(labels));
    }

    fn increment(&self, name: &str, labels: &[(&str, String)]) {
        metrics::increment_counter!(name.to_string(), to_labels(labels));
    }
}

/// Install the Prometheus exporter, serving scrapes on `listen`
#[cfg(feature = "prometheus")]
pub fn install_exporter(listen: SocketAddr) -> anyhow::Result<()> {
    use anyhow::Context;

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(listen)
        .install()
        .context("Failed to install Prometheus exporter")?;
    info!(listen = %listen, "Prometheus exporter installed");
    Ok(())
}

/// Without the exporter metrics stay with whatever recorder is installed
#[cfg(not(feature = "prometheus"))]
pub fn install_exporter(listen: SocketAddr) -> anyhow::Result<()> {
    info!(listen = %listen, "Prometheus support not compiled in, metrics are not exported");
    Ok(())
}
