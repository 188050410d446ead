//! Persisted project record
//!
//! Written to `<data_dir>/projects/<project>/state.json` so that later
//! invocations can report status, stream logs, and tear down services started
//! by a detached `up`.

use super::board::{ServiceStatus, StateChange};
use super::state::ServiceState;
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// File name of the record inside the project directory
pub const RECORD_FILE: &str = "state.json";

/// Project record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub project: String,
    /// Topology file the project was started from
    pub file: PathBuf,
    /// SHA-256 of the topology file at startup
    pub digest: String,
    /// Pid of a foreground supervisor, if one is running
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supervisor_pid: Option<u32>,
    pub services: Vec<ServiceStatus>,
    /// Recent transitions, oldest first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<StateChange>,
    pub updated_at: DateTime<Utc>,
}

impl ProjectRecord {
    pub fn new(project: &str, file: &Path, content: &str) -> Self {
        Self {
            project: project.to_string(),
            file: file.to_path_buf(),
            digest: digest(content),
            supervisor_pid: None,
            services: Vec::new(),
            history: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn path(project_dir: &Path) -> PathBuf {
        project_dir.join(RECORD_FILE)
    }

    /// Load the record of a project, if one exists
    pub fn load(project_dir: &Path) -> Result<Option<Self>> {
        let path = Self::path(project_dir);
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Write the record atomically
    pub fn save(&mut self, project_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(project_dir)?;
        self.updated_at = Utc::now();

        let path = Self::path(project_dir);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(self)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn remove(project_dir: &Path) -> Result<()> {
        let path = Self::path(project_dir);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Close the record after a shutdown. A clean shutdown removes it;
    /// otherwise it is kept, without a supervisor, so that `down` can still
    /// reach the services left behind.
    pub fn finish(&mut self, project_dir: &Path, clean: bool) -> Result<()> {
        if clean {
            return Self::remove(project_dir);
        }
        self.supervisor_pid = None;
        self.save(project_dir)
    }

    /// Whether the topology file changed since the record was written
    pub fn is_stale(&self, content: &str) -> bool {
        self.digest != digest(content)
    }

    pub fn service(&self, name: &str) -> Option<&ServiceStatus> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Names of the services currently in `state`
    pub fn in_state(&self, state: ServiceState) -> Vec<&str> {
        self.services
            .iter()
            .filter(|s| s.state == state)
            .map(|s| s.name.as_str())
            .collect()
    }

    /// The last `n` recorded transitions, oldest first
    pub fn recent(&self, n: usize) -> &[StateChange] {
        &self.history[self.history.len().saturating_sub(n)..]
    }

    /// Restarts of a service visible in the history
    pub fn restarts(&self, service: &str) -> usize {
        self.history
            .iter()
            .filter(|c| c.service == service)
            .filter(|c| c.from == ServiceState::Failed && c.to == ServiceState::Starting)
            .count()
    }
}

/// Hex SHA-256 of a topology document
pub fn digest(content: &str) -> String {
    let hash = Sha256::digest(content.as_bytes());
    hash.iter().map(|b| format!("{:02x}", b)).collect()
}
