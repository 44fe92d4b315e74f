//! Error types for the Lattice gateway controller
//!
//! Errors are structured with fields to aid debugging in production. The
//! variants mirror how a failure must be handled by a reconciler:
//!
//! - **Validation**: malformed route/policy spec; surfaced as a status
//!   condition and never retried until the object changes
//! - **NotFound**: a referenced object (backend Service, Gateway, ...) does
//!   not exist yet; retried because the cluster may still be converging
//! - **CrdNotInstalled**: an optional CRD is absent; callers treat this as
//!   "feature not installed"
//! - **Cloud**: a mesh API call failed
//! - **Requeue**: the mesh API is eventually consistent and asked us to come
//!   back later; translated into a bounded-delay requeue

use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Upper bound for any requeue delay requested through [`Error::Requeue`]
pub const MAX_REQUEUE_DELAY: Duration = Duration::from_secs(60);

/// Main error type for Lattice gateway operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for a route, gateway or policy spec
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Object with the invalid configuration (namespace/name)
        resource: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.rules[0].matches[0].headers")
        field: Option<String>,
    },

    /// A referenced Kubernetes object does not exist
    #[error("{kind} {name} not found")]
    NotFound {
        /// Kind of the missing object (Service, ServiceImport, Gateway, ...)
        kind: String,
        /// namespace/name of the missing object
        name: String,
    },

    /// An optional CRD is not installed in the cluster
    #[error("CRD for {kind} is not installed")]
    CrdNotInstalled {
        /// Kind whose CRD is missing
        kind: String,
    },

    /// Mesh (VPC Lattice) API error
    #[error("lattice API error [{operation}]: {message}")]
    Cloud {
        /// API operation that failed (e.g., "CreateService")
        operation: String,
        /// Description of what failed
        message: String,
        /// Whether this error is retryable
        retryable: bool,
    },

    /// Eventually consistent state; try again after the given delay
    #[error("requeue after {after:?}: {message}")]
    Requeue {
        /// Why the operation must be retried
        message: String,
        /// Delay before retrying
        after: Duration,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "stack", "reconciler")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    ///
    /// For simple validation errors without object context.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with object context
    pub fn validation_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with object context and field path
    pub fn validation_for_field(
        resource: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a not-found error for a referenced object
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a CRD-not-installed error
    pub fn crd_not_installed(kind: impl Into<String>) -> Self {
        Self::CrdNotInstalled { kind: kind.into() }
    }

    /// Create a retryable mesh API error
    pub fn cloud(operation: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Cloud {
            operation: operation.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable mesh API error (conflict of ownership, bad input)
    pub fn cloud_permanent(operation: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Cloud {
            operation: operation.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create a requeue request; the delay is capped at [`MAX_REQUEUE_DELAY`]
    pub fn requeue(msg: impl Into<String>, after: Duration) -> Self {
        Self::Requeue {
            message: msg.into(),
            after: after.min(MAX_REQUEUE_DELAY),
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
    /// Validation errors need an object change and are not retryable.
    /// Missing references are retryable while the cluster converges.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae)
                    if (400..500).contains(&ae.code) && ae.code != 404 && ae.code != 409
            ),
            Error::Validation { .. } => false,
            Error::NotFound { .. } => true,
            Error::CrdNotInstalled { .. } => false,
            Error::Cloud { retryable, .. } => *retryable,
            Error::Requeue { .. } => true,
            Error::Internal { .. } => true,
        }
    }

    /// Delay requested by an eventually consistent dependency, if any
    pub fn requeue_after(&self) -> Option<Duration> {
        match self {
            Error::Requeue { after, .. } => Some(*after),
            _ => None,
        }
    }

    /// Whether this error reports a missing object or API resource
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } | Error::CrdNotInstalled { .. } => true,
            Error::Kube { source } => crate::kube_utils::is_not_found(source),
            _ => false,
        }
    }

    /// Whether this error is a spec validation failure
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation { .. })
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}
