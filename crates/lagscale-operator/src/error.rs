//! Error types for the Lagscale operator

use std::fmt;
use thiserror::Error;

/// Errors that can occur during a reconcile cycle or a store call
#[derive(Error, Debug)]
pub enum OperatorError {
    /// The topic referenced by a ConsumerAutoscaler does not exist
    #[error("topic {0} not found")]
    DependencyMissing(String),

    /// The referenced topic exists but is not ready yet
    #[error("topic {0} is not ready")]
    DependencyNotReady(String),

    /// Malformed ConsumerAutoscaler spec or ownership conflict
    #[error("{0}")]
    InvalidSpec(String),

    /// Stale write rejected by the store
    #[error("write conflict on {kind} {name}")]
    Conflict { kind: String, name: String },

    /// Create collided with an existing object
    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: String, name: String },

    /// The store could not be reached or refused the call
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// The cycle exceeded its deadline
    #[error("cycle exceeded deadline of {0:?}")]
    Timeout(std::time::Duration),

    /// Some, but not all, child applies failed
    #[error("{failed} of {attempted} child applies failed, first: {first}")]
    PartialApplyFailure {
        failed: usize,
        attempted: usize,
        first: Box<OperatorError>,
    },
}

/// Result type for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

/// Stable tag for each failure class, used in status messages and metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    DependencyMissing,
    DependencyNotReady,
    InvalidSpec,
    Conflict,
    StoreUnavailable,
    Timeout,
    PartialApplyFailure,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::DependencyMissing => "DependencyMissing",
            ErrorKind::DependencyNotReady => "DependencyNotReady",
            ErrorKind::InvalidSpec => "InvalidSpec",
            ErrorKind::Conflict => "Conflict",
            ErrorKind::StoreUnavailable => "StoreUnavailable",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::PartialApplyFailure => "PartialApplyFailure",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl OperatorError {
    /// Classify this error into the reconcile failure taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            OperatorError::DependencyMissing(_) => ErrorKind::DependencyMissing,
            OperatorError::DependencyNotReady(_) => ErrorKind::DependencyNotReady,
            OperatorError::InvalidSpec(_) => ErrorKind::InvalidSpec,
            // A create that collides means our view was stale; same handling as a conflict.
            OperatorError::Conflict { .. } | OperatorError::AlreadyExists { .. } => {
                ErrorKind::Conflict
            }
            OperatorError::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
            OperatorError::Timeout(_) => ErrorKind::Timeout,
            OperatorError::PartialApplyFailure { .. } => ErrorKind::PartialApplyFailure,
        }
    }

    /// Check if this error is retried automatically
    pub fn is_retryable(&self) -> bool {
        !matches!(self.kind(), ErrorKind::InvalidSpec)
    }

    /// Human-readable form written to `status.message`
    pub fn status_message(&self) -> String {
        format!("{}: {}", self.kind(), self)
    }
}
