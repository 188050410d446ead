//! Error types for Berth

use thiserror::Error;

/// Result type for Berth operations
pub type Result<T> = std::result::Result<T, BerthError>;

/// Berth error types
#[derive(Error, Debug)]
pub enum BerthError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Compose file parse error: {0}")]
    ComposeParse(String),

    #[error("Dependency cycle detected between services: {}", participants.join(", "))]
    Cycle { participants: Vec<String> },

    #[error("External secret not found: {0}")]
    MissingExternalSecret(String),

    #[error("Failed to start service {service}: {reason}")]
    Start { service: String, reason: String },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Service {service} failed: {reason}")]
    ServiceFailed { service: String, reason: String },

    #[error("Service {service} failed after {attempts} restart attempt(s): {reason}")]
    RetryExhausted {
        service: String,
        attempts: u32,
        reason: String,
    },

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Volume error: {0}")]
    Volume(String),

    #[error("Volume not found: {0}")]
    VolumeNotFound(String),

    #[error("Secret error: {0}")]
    Secret(String),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Invalid state transition for {service}: {from} -> {to}")]
    InvalidTransition {
        service: String,
        from: String,
        to: String,
    },

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BerthError {
    /// Whether the error was raised while loading or validating the topology,
    /// before any service was touched.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            BerthError::Config(_)
                | BerthError::ComposeParse(_)
                | BerthError::Cycle { .. }
                | BerthError::MissingExternalSecret(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_lists_participants() {
        let err = BerthError::Cycle {
            participants: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Dependency cycle detected between services: a, b"
        );
        assert!(err.is_configuration());
    }

    #[test]
    fn test_runtime_errors_are_not_configuration() {
        let err = BerthError::Start {
            service: "db".to_string(),
            reason: "exit 1".to_string(),
        };
        assert!(!err.is_configuration());
    }
}
