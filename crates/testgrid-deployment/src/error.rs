//! Error taxonomy for the deployment layer.
//!
//! Each contract boundary has its own error type so callers can branch on
//! the failure category: [`StagingError`] for resource staging,
//! [`ExecutionError`] for process invocation, and [`DeployError`] for the
//! `deploy` call as a whole.

use std::path::PathBuf;

use crate::lifecycle::DeployPhase;
use crate::model::DeployerType;

/// Errors produced while materializing a script into the deployment repository.
#[derive(Debug, thiserror::Error)]
pub enum StagingError {
    #[error("embedded asset not found: {name}")]
    AssetNotFound { name: String },

    #[error("deployment script not found: {}", path.display())]
    ScriptNotFound { path: PathBuf },

    #[error("failed to stage {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors produced while running a staged script.
///
/// A non-zero exit code is not an error; it is reported through
/// [`ExecutionOutcome`](crate::executor::ExecutionOutcome).
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed waiting for deployment script: {source}")]
    Wait {
        #[source]
        source: std::io::Error,
    },

    #[error("deployment script timed out after {elapsed_ms}ms (limit {limit_ms}ms)")]
    Timeout {
        limit_ms: u64,
        elapsed_ms: u64,
        /// Output captured before the process group was killed.
        stdout: String,
        stderr: String,
        stdout_truncated: bool,
        stderr_truncated: bool,
    },
}

/// Errors that fail a `deploy` call outright.
///
/// Script-level failures (non-zero exit, missing markers, timeout) are not
/// represented here; they are carried in the returned
/// [`DeploymentCreationResult`](crate::model::DeploymentCreationResult).
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("no deployer registered for type {0}")]
    UnknownDeployer(DeployerType),

    #[error("staging error: {0}")]
    Staging(#[from] StagingError),

    #[error("execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("invalid deploy phase transition: {from} -> {to}")]
    InvalidTransition { from: DeployPhase, to: DeployPhase },

    #[error("invalid deployer configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid script descriptor: {0}")]
    InvalidScript(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeployError {
    /// True when the requested embedded asset does not exist.
    pub fn is_asset_not_found(&self) -> bool {
        matches!(
            self,
            DeployError::Staging(StagingError::AssetNotFound { .. })
        )
    }

    /// True when the script exceeded its time bound.
    pub fn is_timeout(&self) -> bool {
        matches!(self, DeployError::Execution(ExecutionError::Timeout { .. }))
    }
}

/// Result type for staging operations.
pub type StagingResult<T> = std::result::Result<T, StagingError>;

/// Result type for script execution.
pub type ExecutionResult<T> = std::result::Result<T, ExecutionError>;

/// Result type for deploy operations.
pub type DeployResult<T> = std::result::Result<T, DeployError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_deployer_display() {
        let err = DeployError::UnknownDeployer(DeployerType::Docker);
        assert!(err.to_string().contains("DOCKER"));
    }

    #[test]
    fn test_asset_not_found_classification() {
        let err: DeployError = StagingError::AssetNotFound {
            name: "missing.sh".to_string(),
        }
        .into();
        assert!(err.is_asset_not_found());
        assert!(!err.is_timeout());
        assert!(err.to_string().contains("missing.sh"));
    }

    #[test]
    fn test_timeout_display() {
        let err: DeployError = ExecutionError::Timeout {
            limit_ms: 1000,
            elapsed_ms: 1004,
            stdout: String::new(),
            stderr: String::new(),
            stdout_truncated: false,
            stderr_truncated: false,
        }
        .into();
        assert!(err.is_timeout());
        let msg = err.to_string();
        assert!(msg.contains("1004ms"));
        assert!(msg.contains("limit 1000ms"));
    }

    #[test]
    fn test_staging_io_names_path() {
        let err = StagingError::Io {
            path: PathBuf::from("/repo/deploy.sh"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        let msg = err.to_string();
        assert!(msg.contains("/repo/deploy.sh"));
        assert!(msg.contains("denied"));
    }
}
