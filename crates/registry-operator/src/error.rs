//! Error types for the Apicurio Registry operator
//!
//! Only the kube-facing collaborators and the controller return these. Control
//! functions never fail: they report problems through status conditions and
//! requeue requests on the loop context.

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during operator operations
#[derive(Error, Debug)]
pub enum OperatorError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Resource not found
    #[error("Resource not found: {kind}/{name} in namespace {namespace}")]
    NotFound {
        kind: String,
        name: String,
        namespace: String,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Reconciliation failed
    #[error("Reconciliation failed: {0}")]
    ReconcileFailed(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML serialization error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Validation error
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Environment variable name rejected by the env cache
    #[error("Environment variable can not be empty nor whitespace: {0:?}")]
    InvalidEnvName(String),

    /// A managed resource can not be created without its owning registry
    #[error("Owner {0} is not available, can not create dependent resource")]
    MissingOwner(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

impl OperatorError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OperatorError::KubeError(_)
                | OperatorError::ReconcileFailed(_)
                | OperatorError::MissingOwner(_)
        )
    }

    /// Get a suggested requeue delay for retryable errors
    pub fn requeue_delay(&self) -> Option<Duration> {
        match self {
            OperatorError::MissingOwner(_) => Some(Duration::from_secs(5)),
            e if e.is_retryable() => Some(Duration::from_secs(30)),
            _ => None,
        }
    }
}
