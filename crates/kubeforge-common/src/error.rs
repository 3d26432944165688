//! Error types for kubeforge
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries the context an operator needs to act on it: the
//! cluster, the resource class and id, or the operation that timed out.

use std::time::Duration;

use thiserror::Error;

use crate::types::{ResourceClass, ResourceRef};

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for kubeforge operations
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// A cluster or backend resource does not exist
    #[error("{kind} not found: {name}")]
    NotFound {
        /// What was looked up (e.g. "cluster", "node", "backend")
        kind: String,
        /// Identifier that was looked up
        name: String,
    },

    /// The backend rejected our identity or credentials
    #[error("authentication failed for backend {backend}: {message}")]
    Authentication {
        /// Backend that rejected the request
        backend: String,
        /// Description of what failed
        message: String,
    },

    /// A backend create call failed
    #[error("failed to create {class} {name}: {message}")]
    ResourceCreation {
        /// Class of the resource being created
        class: ResourceClass,
        /// Name of the resource being created
        name: String,
        /// Description of what failed
        message: String,
        /// Resources the backend reports it created before failing
        created: Vec<ResourceRef>,
    },

    /// A backend delete call failed
    #[error("failed to delete {class} {id}: {message}")]
    ResourceDeletion {
        /// Class of the resource being deleted
        class: ResourceClass,
        /// Backend id of the resource
        id: String,
        /// Description of what failed
        message: String,
    },

    /// A delete was rejected because a live resource still references the target
    #[error("dependency violation deleting {class} {id}: {message}")]
    DependencyViolation {
        /// Class of the resource being deleted
        class: ResourceClass,
        /// Backend id of the resource
        id: String,
        /// Backend message naming the dependent, if any
        message: String,
    },

    /// A cluster specification field is invalid for the target backend
    #[error("invalid configuration for {cluster}: {message}")]
    Configuration {
        /// Name of the cluster with invalid configuration
        cluster: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "controlPlane.replicas")
        field: Option<String>,
    },

    /// An operation did not finish within its time budget
    #[error("timed out after {}s waiting for {operation}", duration.as_secs())]
    Timeout {
        /// Operation that timed out
        operation: String,
        /// Time budget that was exceeded
        duration: Duration,
    },

    /// The backend refused the request because an account quota is exhausted
    #[error("quota exceeded on backend {backend}: {message}")]
    QuotaExceeded {
        /// Backend that reported the quota
        backend: String,
        /// Description of the exhausted quota
        message: String,
    },

    /// Transient network failure talking to the backend or a node
    #[error("transient network error: {message}")]
    TransientNetwork {
        /// Description of what failed
        message: String,
    },

    /// Input failed validation before any backend call was made
    #[error("validation error for {cluster}: {message}")]
    Validation {
        /// Name of the cluster being validated
        cluster: String,
        /// Description of what's invalid
        message: String,
    },

    /// A remote command on a node exited unsuccessfully
    #[error("command `{command}` on node {node} exited with {exit_code}: {stderr}")]
    RemoteCommand {
        /// Node the command ran on
        node: String,
        /// The command line (secrets elided by the caller)
        command: String,
        /// Process exit code
        exit_code: i32,
        /// Captured standard error
        stderr: String,
    },

    /// The operation was cancelled by its caller
    #[error("operation cancelled: {operation}")]
    Cancelled {
        /// Operation that observed the cancellation
        operation: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "registry", "pipeline")
        context: String,
    },
}

impl Error {
    /// Create a not-found error
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create an authentication error
    pub fn authentication(backend: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Authentication {
            backend: backend.into(),
            message: msg.into(),
        }
    }

    /// Create a resource creation error with no partially-created resources
    pub fn creation(class: ResourceClass, name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ResourceCreation {
            class,
            name: name.into(),
            message: msg.into(),
            created: Vec::new(),
        }
    }

    /// Create a resource creation error that reports what the backend managed to create
    pub fn creation_partial(
        class: ResourceClass,
        name: impl Into<String>,
        msg: impl Into<String>,
        created: Vec<ResourceRef>,
    ) -> Self {
        Self::ResourceCreation {
            class,
            name: name.into(),
            message: msg.into(),
            created,
        }
    }

    /// Create a resource deletion error
    pub fn deletion(class: ResourceClass, id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ResourceDeletion {
            class,
            id: id.into(),
            message: msg.into(),
        }
    }

    /// Create a dependency violation error
    pub fn dependency_violation(
        class: ResourceClass,
        id: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::DependencyViolation {
            class,
            id: id.into(),
            message: msg.into(),
        }
    }

    /// Create a configuration error without a field path
    pub fn configuration(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Configuration {
            cluster: cluster.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a configuration error pointing at a specific field
    pub fn configuration_field(
        cluster: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Configuration {
            cluster: cluster.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create a quota error
    pub fn quota_exceeded(backend: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::QuotaExceeded {
            backend: backend.into(),
            message: msg.into(),
        }
    }

    /// Create a transient network error
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientNetwork {
            message: msg.into(),
        }
    }

    /// Create a validation error with the given message
    ///
    /// For simple validation errors without cluster context.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            cluster: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
        }
    }

    /// Create a validation error with cluster context
    pub fn validation_for(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create a remote command error
    pub fn remote_command(
        node: impl Into<String>,
        command: impl Into<String>,
        exit_code: i32,
        stderr: impl Into<String>,
    ) -> Self {
        Self::RemoteCommand {
            node: node.into(),
            command: command.into(),
            exit_code,
            stderr: stderr.into(),
        }
    }

    /// Create a cancellation error
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Only transient network failures and dependency violations (a dependent
    /// resource that has not finished going away) are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::TransientNetwork { .. } | Error::DependencyViolation { .. }
        )
    }

    /// Whether the backend rejected a delete because of live dependents
    pub fn is_dependency_violation(&self) -> bool {
        matches!(self, Error::DependencyViolation { .. })
    }

    /// Whether the target does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Whether the operation stopped because its caller cancelled it
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled { .. })
    }

    /// Get the cluster name if this error is associated with a specific cluster
    pub fn cluster(&self) -> Option<&str> {
        match self {
            Error::Configuration { cluster, .. } => Some(cluster),
            Error::Validation { cluster, .. } => Some(cluster),
            _ => None,
        }
    }

    /// Resources a failed create call reports it left behind
    pub fn partially_created(&self) -> &[ResourceRef] {
        match self {
            Error::ResourceCreation { created, .. } => created,
            _ => &[],
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::serialization(e.to_string())
    }
}
