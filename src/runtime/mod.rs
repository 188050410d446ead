//! Runtime adapter
//!
//! The narrow interface between the supervisor and whatever actually runs a
//! service. The supervisor only ever talks to a [`Runtime`]; it never spawns
//! or signals processes itself.

pub mod fake;
pub mod process;
pub mod signal;

pub use fake::FakeRuntime;
pub use process::ProcessRuntime;

use crate::compose::topology::{Healthcheck, Mount, PortMapping, Service};
use crate::error::{BerthError, Result};
use crate::storage::{Acquired, SecretValue};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Result of a health probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Healthy,
    Unhealthy,
    /// The runtime could not tell
    Unknown,
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Health::Healthy => write!(f, "healthy"),
            Health::Unhealthy => write!(f, "unhealthy"),
            Health::Unknown => write!(f, "unknown"),
        }
    }
}

/// Reference to a started service instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeHandle {
    /// Unique per start
    pub id: String,
    pub service: String,
    /// Host process id, when the runtime has one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
}

impl RuntimeHandle {
    pub fn new(service: &str, pid: Option<u32>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            service: service.to_string(),
            pid,
            started_at: Utc::now(),
        }
    }
}

/// Host path exposed to a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchMount {
    pub source: PathBuf,
    pub target: String,
    pub read_only: bool,
}

/// Secret value exposed to a service
#[derive(Debug, Clone)]
pub struct LaunchSecret {
    pub name: String,
    pub target: String,
    pub value: SecretValue,
}

/// Everything a runtime needs to start one service
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub project: String,
    /// Directory relative paths in the topology are resolved against
    pub project_dir: PathBuf,
    pub service: String,
    /// Opaque image/command reference
    pub reference: String,
    pub image: Option<String>,
    pub command: Option<Vec<String>>,
    pub environment: BTreeMap<String, String>,
    pub working_dir: Option<String>,
    pub mounts: Vec<LaunchMount>,
    pub secrets: Vec<LaunchSecret>,
    pub ports: Vec<PortMapping>,
    pub healthcheck: Option<Healthcheck>,
}

impl LaunchSpec {
    /// Build the launch description of a service from the resources
    /// acquired for it. Environment entries without a value are taken from
    /// the current process environment and dropped when unset there.
    pub fn build(
        project: &str,
        project_dir: &Path,
        service: &Service,
        acquired: &Acquired,
    ) -> Result<Self> {
        let environment = service
            .environment
            .iter()
            .filter_map(|(key, value)| match value {
                Some(value) => Some((key.clone(), value.clone())),
                None => std::env::var(key).ok().map(|v| (key.clone(), v)),
            })
            .collect();

        let mut mounts = Vec::with_capacity(service.mounts.len());
        for mount in &service.mounts {
            let launch = match mount {
                Mount::Volume {
                    volume,
                    target,
                    read_only,
                } => {
                    let handle = acquired.volume(volume).ok_or_else(|| {
                        BerthError::Internal(format!(
                            "volume {} was not acquired for {}",
                            volume, service.name
                        ))
                    })?;
                    LaunchMount {
                        source: handle.mountpoint.clone(),
                        target: target.clone(),
                        read_only: *read_only,
                    }
                }
                Mount::Bind {
                    source,
                    target,
                    read_only,
                } => LaunchMount {
                    source: resolve_host_path(project_dir, source),
                    target: target.clone(),
                    read_only: *read_only,
                },
            };
            mounts.push(launch);
        }

        let mut secrets = Vec::with_capacity(service.secrets.len());
        for mount in &service.secrets {
            let handle = acquired.secret(&mount.secret).ok_or_else(|| {
                BerthError::Internal(format!(
                    "secret {} was not acquired for {}",
                    mount.secret, service.name
                ))
            })?;
            secrets.push(LaunchSecret {
                name: mount.secret.clone(),
                target: mount.target.clone(),
                value: handle.value.clone(),
            });
        }

        Ok(Self {
            project: project.to_string(),
            project_dir: project_dir.to_path_buf(),
            service: service.name.clone(),
            reference: service.reference(),
            image: service.image.clone(),
            command: service.command.as_ref().map(|c| c.argv()),
            environment,
            working_dir: service.working_dir.clone(),
            mounts,
            secrets,
            ports: service.ports.clone(),
            healthcheck: service.healthcheck.clone(),
        })
    }
}

fn resolve_host_path(project_dir: &Path, source: &str) -> PathBuf {
    if let Some(rest) = source.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    project_dir.join(source)
}

/// One line of service output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub service: String,
    pub line: String,
}

/// Lazy, unbounded stream of log lines. Dropping the stream cancels the
/// producer.
pub struct LogStream {
    rx: mpsc::Receiver<LogLine>,
    cancel: CancellationToken,
}

impl LogStream {
    pub fn new(rx: mpsc::Receiver<LogLine>, cancel: CancellationToken) -> Self {
        Self { rx, cancel }
    }

    /// Next line, or `None` once the producer is done or cancelled
    pub async fn next(&mut self) -> Option<LogLine> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            line = self.rx.recv() => line,
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for LogStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Interface to the external process/container runtime
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Start a service instance
    async fn start(&self, spec: &LaunchSpec) -> Result<RuntimeHandle>;

    /// Stop an instance, escalating to a forced kill once `timeout` elapses.
    /// Returns [`BerthError::Timeout`] when the escalation was needed.
    async fn stop(&self, handle: &RuntimeHandle, timeout: Duration) -> Result<()>;

    /// Check whether an instance is ready to serve dependents
    async fn probe_health(&self, handle: &RuntimeHandle) -> Health;

    /// Stream the instance's output until `cancel` fires
    async fn stream_logs(
        &self,
        handle: &RuntimeHandle,
        cancel: CancellationToken,
    ) -> Result<LogStream>;
}
