//! Configuration of the control-plane process
//!
//! The controller settings come from `ControllerConfig::load`; this module
//! adds the process-level settings and the jobs started at boot.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::net::SocketAddr;
use tracing::{info, warn};

use indexctl_core::{BuildId, ControllerConfig, CoreError, JobKind};

/// Job started when the process boots
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Job id, generated when absent
    #[serde(default)]
    pub build_id: Option<String>,

    /// Job variant
    pub kind: JobKind,

    /// Template of custom graphs
    #[serde(default)]
    pub config_path: String,

    /// Where the job writes its index
    pub index_root: String,

    /// Template parameters
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl JobSpec {
    /// Id of the job, generating one when none was configured
    pub fn build_id(&self) -> BuildId {
        match &self.build_id {
            Some(id) => BuildId(id.clone()),
            None => BuildId::generate(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct JobsFile {
    #[serde(default)]
    jobs: Vec<JobSpec>,
}

/// Process configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Controller settings
    pub controller: ControllerConfig,

    /// Prometheus scrape address
    pub metrics_listen: Option<SocketAddr>,

    /// Jobs to start at boot
    pub jobs: Vec<JobSpec>,
}

impl ServerConfig {
    /// Load the controller settings, `INDEXCTL_METRICS_LISTEN` and the jobs
    /// file named by `INDEXCTL_JOBS`
    pub fn load() -> Result<Self, CoreError> {
        let controller = ControllerConfig::load()?;

        let metrics_listen = match env::var("INDEXCTL_METRICS_LISTEN") {
            Ok(value) => match value.parse::<SocketAddr>() {
                Ok(addr) => Some(addr),
                Err(_) => {
                    warn!("Invalid INDEXCTL_METRICS_LISTEN value: {}", value);
                    None
                }
            },
            Err(_) => None,
        };

        let jobs = match env::var("INDEXCTL_JOBS") {
            Ok(path) => {
                let content = std::fs::read_to_string(&path).map_err(|e| {
                    CoreError::ConfigurationError(format!("cannot read jobs file {}: {}", path, e))
                })?;
                Self::parse_jobs(&content)?
            }
            Err(_) => Vec::new(),
        };

        info!(jobs = jobs.len(), "Loaded server configuration");
        Ok(Self {
            controller,
            metrics_listen,
            jobs,
        })
    }

    /// Parse the jobs file format: `jobs: [{kind, index_root, ...}]`
    pub fn parse_jobs(content: &str) -> Result<Vec<JobSpec>, CoreError> {
        let file: JobsFile = serde_yaml::from_str(content)
            .map_err(|e| CoreError::ConfigurationError(format!("invalid jobs file: {}", e)))?;
        Ok(file.jobs)
    }
}
