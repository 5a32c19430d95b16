//! Error types for Stevedore

use std::time::Duration;
use thiserror::Error;

/// Result type for Stevedore operations
pub type Result<T> = std::result::Result<T, StevedoreError>;

/// Top-level error type
#[derive(Error, Debug)]
pub enum StevedoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Orchestration(#[from] OrchestrationError),

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error("Compose file parse error: {0}")]
    ComposeParse(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Project definition errors. Always raised before any runtime call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Dependency cycle detected between services: {}", .services.join(", "))]
    CycleDetected { services: Vec<String> },

    #[error("Service '{service}' depends on unknown service '{dependency}'")]
    UnknownDependency { service: String, dependency: String },

    #[error("Project defines no services")]
    EmptyProject,

    #[error("Service '{0}' is defined more than once")]
    DuplicateName(String),

    #[error("Service '{service}' is invalid: {reason}")]
    InvalidService { service: String, reason: String },
}

/// Errors reported by a container runtime adapter
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    /// Worth retrying (connection reset, engine busy)
    #[error("Transient runtime error: {0}")]
    Transient(String),

    #[error("Runtime error: {0}")]
    Permanent(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Runtime call timed out: {0}")]
    Timeout(String),
}

impl AdapterError {
    /// Whether the orchestrator may retry the failed call
    pub fn is_transient(&self) -> bool {
        matches!(self, AdapterError::Transient(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, AdapterError::NotFound(_))
    }
}

/// A service that failed during an orchestrated operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceFailure {
    pub service: String,
    pub cause: AdapterError,
}

impl std::fmt::Display for ServiceFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.service, self.cause)
    }
}

/// Errors from a lifecycle operation. Partial success is reported, not hidden.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrchestrationError {
    #[error("Service '{service}' failed: {cause}")]
    BatchFailed { service: String, cause: AdapterError },

    #[error("Service '{service}' did not settle within {after:?}")]
    Timeout { service: String, after: Duration },

    #[error(
        "Operation partially failed: succeeded [{}], failed [{}], skipped [{}]",
        .succeeded.join(", "),
        .failed.iter().map(|f| f.to_string()).collect::<Vec<_>>().join("; "),
        .skipped.join(", ")
    )]
    PartialFailure {
        succeeded: Vec<String>,
        failed: Vec<ServiceFailure>,
        skipped: Vec<String>,
    },

    #[error("Containers still running (stop them or use force): {}", .containers.join(", "))]
    StillRunning { containers: Vec<String> },

    #[error("Operation cancelled: completed [{}], pending [{}]", .completed.join(", "), .pending.join(", "))]
    Cancelled {
        completed: Vec<String>,
        pending: Vec<String>,
    },

    #[error("Runtime call for '{service}' failed: {cause}")]
    Adapter { service: String, cause: AdapterError },
}

impl OrchestrationError {
    /// Build the error for a halted operation.
    ///
    /// A lone failure with nothing succeeded is a `BatchFailed` (everything
    /// after it was never attempted); anything else is a `PartialFailure`.
    pub fn from_outcome(
        succeeded: Vec<String>,
        mut failed: Vec<ServiceFailure>,
        skipped: Vec<String>,
    ) -> Self {
        if succeeded.is_empty() && failed.len() == 1 {
            let failure = failed.remove(0);
            return OrchestrationError::BatchFailed {
                service: failure.service,
                cause: failure.cause,
            };
        }
        OrchestrationError::PartialFailure {
            succeeded,
            failed,
            skipped,
        }
    }

    /// Names of the services that failed, if any
    pub fn failed_services(&self) -> Vec<&str> {
        match self {
            OrchestrationError::BatchFailed { service, .. }
            | OrchestrationError::Timeout { service, .. }
            | OrchestrationError::Adapter { service, .. } => vec![service.as_str()],
            OrchestrationError::PartialFailure { failed, .. } => {
                failed.iter().map(|f| f.service.as_str()).collect()
            }
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_failure_is_batch_failed() {
        let err = OrchestrationError::from_outcome(
            Vec::new(),
            vec![ServiceFailure {
                service: "db".to_string(),
                cause: AdapterError::Permanent("no such image".to_string()),
            }],
            vec!["web".to_string()],
        );
        assert!(matches!(err, OrchestrationError::BatchFailed { ref service, .. } if service == "db"));
    }

    #[test]
    fn test_failure_after_success_is_partial() {
        let err = OrchestrationError::from_outcome(
            vec!["db".to_string()],
            vec![ServiceFailure {
                service: "api".to_string(),
                cause: AdapterError::Permanent("boom".to_string()),
            }],
            vec!["web".to_string()],
        );
        assert_eq!(err.failed_services(), vec!["api"]);
        assert!(err.to_string().contains("skipped [web]"));
    }

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(AdapterError::Transient("reset".into()).is_transient());
        assert!(!AdapterError::Permanent("bad".into()).is_transient());
        assert!(!AdapterError::Timeout("stop".into()).is_transient());
        assert!(AdapterError::NotFound("c1".into()).is_not_found());
    }
}
