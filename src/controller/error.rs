//! Error types for the controller.
//!
//! Defines custom error types with classification for retry behavior.

use std::time::Duration;
use thiserror::Error;

use crate::client::ProbeError;

/// Kind of object a delete request was aimed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Member,
    StorageClaim,
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectKind::Member => write!(f, "member"),
            ObjectKind::StorageClaim => write!(f, "storage claim"),
        }
    }
}

/// Error type for controller operations
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Member probe failed
    #[error("Probe error: {0}")]
    Probe(#[from] ProbeError),

    /// A delete request was rejected; nothing was advanced
    #[error("Failed to delete {kind} {name}: {source}")]
    Delete {
        kind: ObjectKind,
        name: String,
        #[source]
        source: kube::Error,
    },

    /// The member is gone but its storage claim could not be deleted
    #[error("Member {member} deleted but its storage claim was not: {source}")]
    StorageCleanup {
        member: String,
        #[source]
        source: kube::Error,
    },

    /// The status snapshot cannot safely drive a promotion
    #[error("Inconsistent cluster status: {0}")]
    InconsistentClusterStatus(String),

    /// Optimistic concurrency conflict on a status update
    #[error("Conflicting update: {0}")]
    Conflict(String),

    /// The reconciliation was cancelled
    #[error("Reconciliation cancelled")]
    Cancelled,

    /// Validation error in resource spec
    #[error("Validation error: {0}")]
    Validation(String),
}

impl Error {
    /// Check if this error indicates a not-found condition
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 404)
    }

    /// Check if this error should be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(e) => {
                // Retry on network errors, rate limiting, and server errors
                matches!(
                    e,
                    kube::Error::Api(api_err) if api_err.code >= 500 || api_err.code == 429
                ) || matches!(e, kube::Error::Service(_))
            }
            Error::Probe(_)
            | Error::Delete { .. }
            | Error::StorageCleanup { .. }
            | Error::InconsistentClusterStatus(_)
            | Error::Conflict(_) => true,
            Error::Cancelled | Error::Validation(_) => false,
        }
    }

    /// Get the recommended requeue duration for this error
    pub fn requeue_after(&self) -> Duration {
        match self {
            // Someone else wrote the cluster; re-read it right away
            Error::Conflict(_) => Duration::from_secs(1),
            Error::StorageCleanup { .. } | Error::Delete { .. } => Duration::from_secs(10),
            Error::InconsistentClusterStatus(_) | Error::Probe(_) => Duration::from_secs(15),
            _ if self.is_retryable() => Duration::from_secs(30),
            // Don't requeue for non-retryable errors
            _ => Duration::from_secs(3600),
        }
    }

    /// Short machine-readable reason, used for events and conditions.
    pub fn reason(&self) -> &'static str {
        match self {
            Error::Kube(_) => "KubernetesApiError",
            Error::Probe(_) => "ProbeFailed",
            Error::Delete { .. } => "DeleteFailed",
            Error::StorageCleanup { .. } => "StorageCleanupFailed",
            Error::InconsistentClusterStatus(_) => "InconsistentClusterStatus",
            Error::Conflict(_) => "Conflict",
            Error::Cancelled => "Cancelled",
            Error::Validation(_) => "ValidationFailed",
        }
    }
}

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, Error>;
