//! Error types for the observer core
//!
//! Metric calls signal expected failures (process gone, pid reused, access
//! denied) with [`SENTINEL`] instead of an error. `ObserverError` is kept for
//! the conditions a caller has to act on.

use std::time::Duration;
use thiserror::Error;

/// Value returned by metric calls when the measurement is unavailable
pub const SENTINEL: f64 = -1.0;

/// Returns true when a metric value is the "unavailable" sentinel
pub fn is_sentinel(value: f64) -> bool {
    value < 0.0
}

/// Failures reported by the directory service
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DirectoryError {
    #[error("directory query `{operation}` timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("directory service unavailable: {0}")]
    Unavailable(String),

    #[error("entity not found: {0}")]
    NotFound(String),

    #[error("invalid directory query argument: {0}")]
    InvalidArgument(String),

    #[error("directory client is closed")]
    Closed,

    #[error("directory service error: {0}")]
    Other(String),
}

impl DirectoryError {
    /// Failures the resolver skips per application or entity
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DirectoryError::Timeout { .. }
                | DirectoryError::Unavailable(_)
                | DirectoryError::NotFound(_)
                | DirectoryError::InvalidArgument(_)
                | DirectoryError::Closed
        )
    }
}

/// Errors surfaced by the observer core
#[derive(Debug, Error)]
pub enum ObserverError {
    /// The elevated helper lost its OS capabilities. The process must restart.
    #[error("elevated helper lost its capabilities: {0}")]
    CapabilitiesLost(String),

    #[error("invalid {metric} threshold {value}: {reason}")]
    InvalidThreshold {
        metric: &'static str,
        value: f64,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed {what}: {reason}")]
    Parse { what: &'static str, reason: String },

    #[error("operation cancelled")]
    Cancelled,
}

impl ObserverError {
    /// Fatal errors end the cycle and the agent process
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ObserverError::CapabilitiesLost(_)
                | ObserverError::InvalidThreshold { .. }
                | ObserverError::InvalidConfig(_)
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ObserverError::Cancelled)
    }

    pub(crate) fn parse(what: &'static str, reason: impl Into<String>) -> Self {
        ObserverError::Parse {
            what,
            reason: reason.into(),
        }
    }
}

pub type Result<T, E = ObserverError> = std::result::Result<T, E>;
