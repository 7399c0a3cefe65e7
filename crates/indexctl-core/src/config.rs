//! Controller configuration
//!
//! Defaults, an optional YAML file named by `INDEXCTL_CONFIG`, then
//! `INDEXCTL_*` environment overrides, in that order.

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use tracing::{info, warn};

use crate::CoreError;

/// Configuration shared by every generation run by one controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Period of the reconciliation tick
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Root search path handed to the template loader
    #[serde(default = "default_template_root")]
    pub template_root: String,

    /// Serialized status documents above this size are gzip-compressed
    #[serde(default = "default_compress_threshold")]
    pub compress_threshold_bytes: usize,

    /// How long terminal flows stay in the graph for inspection
    #[serde(default = "default_flow_retention_secs")]
    pub flow_retention_secs: u64,

    /// Heartbeat age after which a worker node counts as slow
    #[serde(default = "default_slow_worker_threshold_secs")]
    pub slow_worker_threshold_secs: u64,

    /// Stop the whole job as soon as a flow turns fatal
    #[serde(default)]
    pub auto_stop_on_fatal: bool,

    /// Log filter
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON logs instead of the pretty format
    #[serde(default)]
    pub json_logs: bool,
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_template_root() -> String {
    "templates".to_string()
}

fn default_compress_threshold() -> usize {
    64 * 1024
}

fn default_flow_retention_secs() -> u64 {
    600
}

fn default_slow_worker_threshold_secs() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            template_root: default_template_root(),
            compress_threshold_bytes: default_compress_threshold(),
            flow_retention_secs: default_flow_retention_secs(),
            slow_worker_threshold_secs: default_slow_worker_threshold_secs(),
            auto_stop_on_fatal: false,
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

impl ControllerConfig {
    /// Load configuration from the optional config file and the environment
    pub fn load() -> Result<Self, CoreError> {
        let mut config = match env::var("INDEXCTL_CONFIG") {
            Ok(path) => Self::from_yaml_file(&path)?,
            Err(_) => Self::default(),
        };

        config.apply_env_overrides();
        config.validate()?;

        info!("Loaded controller configuration");
        Ok(config)
    }

    /// Parse a YAML configuration file; missing keys fall back to defaults
    pub fn from_yaml_file(path: &str) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CoreError::ConfigurationError(format!("cannot read config file {}: {}", path, e))
        })?;
        Self::from_yaml_str(&content)
    }

    /// Parse YAML configuration text
    pub fn from_yaml_str(content: &str) -> Result<Self, CoreError> {
        serde_yaml::from_str(content)
            .map_err(|e| CoreError::ConfigurationError(format!("invalid config: {}", e)))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(value) = env::var("INDEXCTL_TICK_INTERVAL_MS") {
            match value.parse::<u64>() {
                Ok(v) => self.tick_interval_ms = v,
                Err(_) => warn!("Invalid INDEXCTL_TICK_INTERVAL_MS value: {}", value),
            }
        }

        if let Ok(value) = env::var("INDEXCTL_TEMPLATE_ROOT") {
            self.template_root = value;
        }

        if let Ok(value) = env::var("INDEXCTL_COMPRESS_THRESHOLD_BYTES") {
            match value.parse::<usize>() {
                Ok(v) => self.compress_threshold_bytes = v,
                Err(_) => warn!("Invalid INDEXCTL_COMPRESS_THRESHOLD_BYTES value: {}", value),
            }
        }

        if let Ok(value) = env::var("INDEXCTL_FLOW_RETENTION_SECS") {
            match value.parse::<u64>() {
                Ok(v) => self.flow_retention_secs = v,
                Err(_) => warn!("Invalid INDEXCTL_FLOW_RETENTION_SECS value: {}", value),
            }
        }

        if let Ok(value) = env::var("INDEXCTL_SLOW_WORKER_THRESHOLD_SECS") {
            match value.parse::<u64>() {
                Ok(v) => self.slow_worker_threshold_secs = v,
                Err(_) => warn!("Invalid INDEXCTL_SLOW_WORKER_THRESHOLD_SECS value: {}", value),
            }
        }

        if let Ok(value) = env::var("INDEXCTL_AUTO_STOP_ON_FATAL") {
            self.auto_stop_on_fatal = value.to_lowercase() == "true" || value == "1";
        }

        if let Ok(value) = env::var("INDEXCTL_LOG_LEVEL") {
            self.log_level = value;
        }

        if let Ok(value) = env::var("INDEXCTL_JSON_LOGS") {
            self.json_logs = value.to_lowercase() == "true" || value == "1";
        }
    }

    /// Reject settings the controller cannot run with
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.tick_interval_ms == 0 {
            return Err(CoreError::ConfigurationError(
                "tick_interval_ms must be positive".to_string(),
            ));
        }
        if self.template_root.is_empty() {
            warn!("Empty template_root - templates resolve relative to the working directory");
        }
        Ok(())
    }

    /// Tick period
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Retention of terminal flows
    pub fn flow_retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.flow_retention_secs as i64)
    }

    /// Heartbeat age threshold for slow workers
    pub fn slow_worker_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.slow_worker_threshold_secs as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ControllerConfig::default();
        assert_eq!(config.tick_interval(), Duration::from_secs(1));
        assert_eq!(config.compress_threshold_bytes, 65536);
        assert!(!config.auto_stop_on_fatal);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config = ControllerConfig::from_yaml_str(
            "tick_interval_ms: 250\nauto_stop_on_fatal: true\n",
        )
        .unwrap();
        assert_eq!(config.tick_interval_ms, 250);
        assert!(config.auto_stop_on_fatal);
        assert_eq!(config.template_root, "templates");
        assert_eq!(config.flow_retention(), chrono::Duration::seconds(600));
    }

    #[test]
    fn test_zero_tick_rejected() {
        let config = ControllerConfig {
            tick_interval_ms: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(CoreError::ConfigurationError(_))
        ));
    }

    #[test]
    fn test_invalid_yaml() {
        let result = ControllerConfig::from_yaml_str("tick_interval_ms: [1, 2]");
        assert!(matches!(result, Err(CoreError::ConfigurationError(_))));
    }
}
