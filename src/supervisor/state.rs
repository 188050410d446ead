//! Service states and the transitions between them

use crate::error::BerthError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Lifecycle state of a service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    /// Waiting for dependencies
    #[default]
    Pending,
    /// Started, not yet healthy
    Starting,
    /// Passing health probes
    Healthy,
    /// Failing health probes, within the grace period
    Degraded,
    /// Being stopped
    Stopping,
    /// Stopped
    Stopped,
    /// Failed
    Failed,
}

impl ServiceState {
    /// Whether the state machine allows `self -> to`.
    ///
    /// `Failed -> Starting` is only taken when a restart policy allows it.
    pub fn can_transition(self, to: ServiceState) -> bool {
        use ServiceState::*;

        matches!(
            (self, to),
            (Pending, Starting)
                | (Pending, Stopping)
                | (Starting, Healthy)
                | (Starting, Failed)
                | (Starting, Stopping)
                | (Healthy, Degraded)
                | (Healthy, Stopping)
                | (Degraded, Healthy)
                | (Degraded, Failed)
                | (Degraded, Stopping)
                | (Stopping, Stopped)
                | (Stopping, Failed)
                | (Failed, Starting)
        )
    }

    /// Started and not yet being torn down
    pub fn is_running(self) -> bool {
        matches!(
            self,
            ServiceState::Starting | ServiceState::Healthy | ServiceState::Degraded
        )
    }

    /// The service will not serve dependents again in this session
    pub fn is_down(self) -> bool {
        matches!(
            self,
            ServiceState::Failed | ServiceState::Stopping | ServiceState::Stopped
        )
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceState::Pending => write!(f, "pending"),
            ServiceState::Starting => write!(f, "starting"),
            ServiceState::Healthy => write!(f, "healthy"),
            ServiceState::Degraded => write!(f, "degraded"),
            ServiceState::Stopping => write!(f, "stopping"),
            ServiceState::Stopped => write!(f, "stopped"),
            ServiceState::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for ServiceState {
    type Err = BerthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(ServiceState::Pending),
            "starting" => Ok(ServiceState::Starting),
            "healthy" => Ok(ServiceState::Healthy),
            "degraded" => Ok(ServiceState::Degraded),
            "stopping" => Ok(ServiceState::Stopping),
            "stopped" => Ok(ServiceState::Stopped),
            "failed" => Ok(ServiceState::Failed),
            _ => Err(BerthError::Config(format!("unknown service state '{}'", s))),
        }
    }
}
