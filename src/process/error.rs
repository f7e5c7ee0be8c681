//! Error types for backend process supervision

use std::path::PathBuf;
use std::time::Duration;

use crate::io::ProcessError;

// ============================================================================
// Supervisor Errors
// ============================================================================

/// Errors surfaced by supervisor lifecycle operations
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// Spawning or signalling the process failed
    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    /// Configuration validation errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The backend did not announce its port and pid in time
    #[error("Backend did not become ready within {timeout:?}")]
    StartupTimeout { timeout: Duration },

    /// Automatic restarts were exhausted
    #[error("Backend keeps failing: gave up after {attempts} restart attempts")]
    Failing { attempts: u32 },
}

// ============================================================================
// Configuration Errors
// ============================================================================

/// Configuration validation and building errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Missing required configuration field
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    /// Invalid path format or value
    #[error("Invalid path: {path} - {reason}")]
    InvalidPath { path: PathBuf, reason: String },

    /// Invalid timeout value
    #[error("Invalid timeout: {timeout:?} - {reason}")]
    InvalidTimeout { timeout: Duration, reason: String },

    /// Invalid restart policy
    #[error("Invalid restart policy: {reason}")]
    InvalidRestartPolicy { reason: String },

    /// Library search path fragments could not be joined
    #[error("Invalid library path: {0}")]
    LibraryPath(#[from] std::env::JoinPathsError),
}

impl SupervisorError {
    pub fn startup_timeout(timeout: Duration) -> Self {
        Self::StartupTimeout { timeout }
    }
}

impl ConfigError {
    /// Create a missing field error
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }

    /// Create an invalid path error
    pub fn invalid_path(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid timeout error
    pub fn invalid_timeout(timeout: Duration, reason: impl Into<String>) -> Self {
        Self::InvalidTimeout {
            timeout,
            reason: reason.into(),
        }
    }

    pub fn invalid_restart_policy(reason: impl Into<String>) -> Self {
        Self::InvalidRestartPolicy {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation_helpers() {
        let config_error = ConfigError::missing_field("interpreter");
        assert!(matches!(config_error, ConfigError::MissingField { ref field } if field == "interpreter"));
        assert_eq!(
            config_error.to_string(),
            "Missing required field: interpreter"
        );

        let timeout_error = SupervisorError::startup_timeout(Duration::from_secs(3));
        assert!(matches!(timeout_error, SupervisorError::StartupTimeout { .. }));
    }

    #[test]
    fn test_error_conversion() {
        let config_error = ConfigError::invalid_restart_policy("zero attempts");
        let supervisor_error: SupervisorError = config_error.into();
        assert!(matches!(supervisor_error, SupervisorError::Config(_)));

        let process_error = ProcessError::NotStarted;
        let supervisor_error: SupervisorError = process_error.into();
        assert!(matches!(supervisor_error, SupervisorError::Process(_)));
    }
}
