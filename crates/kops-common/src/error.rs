//! Error types shared by the rolling-update engine and cluster validator
//!
//! Variants carry the context an operator needs to act on a failed rollout:
//! which group, which node, which cloud call.

use thiserror::Error;

/// Main error type for cluster-side kops operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Opaque failure returned by the cloud provider
    #[error("cloud API error during {operation}: {message}")]
    CloudApi {
        /// Cloud operation that failed (e.g. "delete instance")
        operation: String,
        /// Provider message
        message: String,
    },

    /// Cluster did not validate
    #[error("error validating cluster{context}: {message}")]
    ValidationFailed {
        /// Suffix describing when validation ran (e.g. " after terminating instance")
        context: String,
        /// Joined failure messages or the validator error
        message: String,
    },

    /// Draining or tainting a node failed
    #[error("failed to drain node {node:?}: {message}")]
    DrainFailed {
        /// Node being drained
        node: String,
        /// Description of what failed
        message: String,
    },

    /// The rollout was cancelled before completing
    #[error("rolling update cancelled")]
    Cancelled,

    /// Invalid input to an operation (unknown role, missing node, ...)
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Where the error occurred
        context: String,
    },
}

impl Error {
    /// Create a cloud API error
    pub fn cloud(operation: impl Into<String>, msg: impl std::fmt::Display) -> Self {
        Self::CloudApi {
            operation: operation.into(),
            message: msg.to_string(),
        }
    }

    /// Create a validation failure with a context suffix
    pub fn validation_failed(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ValidationFailed {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Create a drain failure for the given node
    pub fn drain_failed(node: impl Into<String>, msg: impl std::fmt::Display) -> Self {
        Self::DrainFailed {
            node: node.into(),
            message: msg.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Returns true if this error is a Kubernetes 404
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 404)
    }
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;
