//! Runtime settings
//!
//! Defaults can be overridden through `BERTH_*` environment variables.
//! Values set per service in the topology file take precedence over these.

use crate::compose::config::parse_duration;
use crate::error::{BerthError, Result};
use crate::storage::secret::DEFAULT_SECRET_PREFIX;
use crate::storage::{ChainSecretProvider, DirectorySecretProvider, EnvSecretProvider};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Berth settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Data directory for project records, logs and volumes
    pub data_dir: PathBuf,
    /// Directory searched for external secrets
    pub secrets_dir: Option<PathBuf>,
    /// Prefix of environment variables holding external secrets
    pub secret_prefix: String,
    /// How long a service may take to become healthy
    pub startup_timeout: Duration,
    /// How long a stop may take before the runtime kills the service
    pub stop_timeout: Duration,
    /// How long shutdown waits for all tasks before aborting them
    pub shutdown_grace: Duration,
    /// Period of health probes for services without a healthcheck interval
    pub probe_interval: Duration,
    /// How long a service may stay degraded before it is failed
    pub degraded_grace: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("/var/lib"))
                .join("berth"),
            secrets_dir: None,
            secret_prefix: DEFAULT_SECRET_PREFIX.to_string(),
            startup_timeout: Duration::from_secs(60),
            stop_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(30),
            probe_interval: Duration::from_secs(1),
            degraded_grace: Duration::from_secs(30),
        }
    }
}

impl Settings {
    /// Defaults overridden by the process environment
    pub fn from_env() -> Result<Self> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_vars(&vars)
    }

    /// Defaults overridden by the given variables
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self> {
        let mut settings = Self::default();

        if let Some(dir) = non_empty(vars, "BERTH_DATA_DIR") {
            settings.data_dir = PathBuf::from(dir);
        }
        if let Some(dir) = non_empty(vars, "BERTH_SECRETS_DIR") {
            settings.secrets_dir = Some(PathBuf::from(dir));
        }
        if let Some(prefix) = non_empty(vars, "BERTH_SECRET_PREFIX") {
            settings.secret_prefix = prefix.to_string();
        }

        let durations = [
            ("BERTH_STARTUP_TIMEOUT", &mut settings.startup_timeout),
            ("BERTH_STOP_TIMEOUT", &mut settings.stop_timeout),
            ("BERTH_SHUTDOWN_GRACE", &mut settings.shutdown_grace),
            ("BERTH_PROBE_INTERVAL", &mut settings.probe_interval),
            ("BERTH_DEGRADED_GRACE", &mut settings.degraded_grace),
        ];
        for (var, field) in durations {
            if let Some(value) = non_empty(vars, var) {
                *field = parse_duration(value)
                    .map_err(|e| BerthError::Config(format!("{}: {}", var, e)))?;
            }
        }

        Ok(settings)
    }

    /// State directory of a project
    pub fn project_dir(&self, project: &str) -> PathBuf {
        self.data_dir.join("projects").join(project)
    }

    /// Directory holding volumes of every project
    pub fn volumes_dir(&self) -> PathBuf {
        self.data_dir.join("volumes")
    }

    /// Store for managed internal secrets of a project
    pub fn secret_store(&self, project: &str) -> PathBuf {
        self.project_dir(project).join("secrets")
    }

    /// Provider chain for external secrets: the environment first, then the
    /// secrets directory when one is configured
    pub fn secret_provider(&self) -> ChainSecretProvider {
        let chain = ChainSecretProvider::new().with(EnvSecretProvider::new(&self.secret_prefix));
        match &self.secrets_dir {
            Some(dir) => chain.with(DirectorySecretProvider::new(dir.clone())),
            None => chain,
        }
    }
}

fn non_empty<'a>(vars: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    vars.get(key).map(String::as_str).filter(|v| !v.is_empty())
}
