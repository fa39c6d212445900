//! Controller-specific error types.
//!
//! This module defines error types specific to the Ingress Manager Controller
//! that are not covered by upstream library errors.

use kube::Error as KubeError;
use thiserror::Error;

/// Errors that can occur in the Ingress Manager Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// The API server rejected or failed a request
    #[error("Kubernetes API request failed: {0}")]
    Api(String),

    /// Object does not exist (read or delete)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Object already exists (create)
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Queue key could not be split into namespace/name
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Object is missing identifying metadata
    #[error("Object has no usable key: {0}")]
    MissingObjectKey(String),

    /// Local cache lookup failed
    #[error("Cache lookup failed: {0}")]
    Cache(String),

    /// Mutating call exceeded its deadline
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Metrics/probe server failure
    #[error("Server error: {0}")]
    Server(String),
}

impl ControllerError {
    /// Whether retrying the same key can succeed without a new event.
    ///
    /// Malformed keys and objects are dropped; everything transient goes
    /// back through the rate limiter.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::InvalidKey(_) | Self::MissingObjectKey(_) | Self::InvalidConfig(_)
        )
    }
}

impl From<prometheus::Error> for ControllerError {
    fn from(e: prometheus::Error) -> Self {
        Self::Server(format!("metrics registry: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_input_is_not_retryable() {
        assert!(!ControllerError::InvalidKey("a/b/c".to_string()).is_retryable());
        assert!(!ControllerError::MissingObjectKey("no name".to_string()).is_retryable());
    }

    #[test]
    fn test_transient_failures_are_retryable() {
        assert!(ControllerError::Cache("store unavailable".to_string()).is_retryable());
        assert!(ControllerError::Api("503".to_string()).is_retryable());
        assert!(ControllerError::Timeout("create".to_string()).is_retryable());
    }
}
