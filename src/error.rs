//! Error types for the hostpath provisioner operator
//!
//! Every fallible operation in the operator returns [`Error`]. The controller's
//! error policy asks [`Error::action`] how the failed pass should be requeued.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Kubernetes / Object Store Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Resource already exists: {kind}/{name}")]
    ResourceExists { kind: String, name: String },

    #[error("Conflict writing {kind}/{name}: the object has been modified")]
    Conflict { kind: String, name: String },

    #[error("No matching API for kind {kind}")]
    CapabilityAbsent { kind: String },

    // =========================================================================
    // Merge Errors
    // =========================================================================
    #[error("{kind}/{name} has no last applied configuration annotation")]
    MissingLastApplied { kind: String, name: String },

    #[error("Merge patch precondition failed: {field} may not change")]
    MergePrecondition { field: String },

    // =========================================================================
    // Reconcile Errors
    // =========================================================================
    #[error("{kind} with extra selector labels spotted, cleaning up and requeueing")]
    SelectorDrift { kind: String, name: String },

    #[error("there should be a single hostpath provisioner, {count} items found")]
    MultipleInstances { count: usize },

    #[error("Unable to determine watch namespace: {0}")]
    Namespace(String),

    // =========================================================================
    // Storage Pool Errors
    // =========================================================================
    #[error("Error: Pool PVC {name} is {phase} instead of Bound")]
    ClaimNotBound { name: String, phase: String },

    // =========================================================================
    // Version Errors
    // =========================================================================
    #[error("operator downgraded from {from} to {to}, will not reconcile")]
    Downgrade { from: String, to: String },

    // =========================================================================
    // Validation Errors
    // =========================================================================
    #[error("{0}")]
    Validation(String),

    // =========================================================================
    // Parse / IO Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::Kube(_)
            | Error::Conflict { .. }
            | Error::ResourceExists { .. }
            | Error::ClaimNotBound { .. }
            | Error::SelectorDrift { .. }
            | Error::Io(_) => ErrorAction::RequeueWithBackoff,

            // Structural problems that need an outside change
            Error::MultipleInstances { .. }
            | Error::Namespace(_)
            | Error::MissingLastApplied { .. }
            | Error::MergePrecondition { .. } => {
                ErrorAction::RequeueAfter(Duration::from_secs(60))
            }

            Error::Downgrade { .. } => ErrorAction::RequeueAfter(Duration::from_secs(300)),

            // Configuration/validation errors - don't retry automatically
            Error::Configuration(_) | Error::Validation(_) => ErrorAction::NoRequeue,

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Kube(_) | Error::Conflict { .. } | Error::ClaimNotBound { .. } | Error::Io(_)
        )
    }

    /// True when the error only signals that an optional API group is not served
    pub fn is_capability_absent(&self) -> bool {
        matches!(self, Error::CapabilityAbsent { .. })
    }
}

/// Result type alias for the operator
pub type Result<T> = std::result::Result<T, Error>;
