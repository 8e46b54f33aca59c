//! Error types for agmon-live
//!
//! Two layers:
//! - [`FetchError`]: one failed network read, classified by [`ErrorKind`].
//!   Aggregator and transport absorb these into session state.
//! - [`MonitorError`]: conditions that surface to the session owner.

use agmon_common::events::{ErrorKind, PendingCreation, SourceName};
use thiserror::Error;

/// Typed failure of a single bounded network read
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct FetchError {
    pub kind: ErrorKind,
    pub message: String,
}

impl FetchError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Malformed, message)
    }

    /// Classify a non-success HTTP status
    pub fn from_status(status: u16, body: &str) -> Self {
        if status == 404 {
            Self::not_found(format!("HTTP 404: {}", body))
        } else {
            Self::network(format!("HTTP {}: {}", status, body))
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            ErrorKind::Timeout
        } else if err.is_decode() {
            ErrorKind::Malformed
        } else if err.status().map(|s| s.as_u16()) == Some(404) {
            ErrorKind::NotFound
        } else {
            ErrorKind::Network
        };
        Self::new(kind, err.to_string())
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(err: serde_json::Error) -> Self {
        Self::malformed(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for FetchError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::timeout("request exceeded its time budget")
    }
}

/// Session-level error conditions
#[derive(Debug, Error)]
pub enum MonitorError {
    /// Resolver exhausted its attempt budget
    #[error("Resource for '{}' not resolved after {attempts} attempts", .pending.lookup_key)]
    ResolutionTimeout {
        pending: PendingCreation,
        attempts: u32,
    },

    /// One aggregator source failing (non-fatal)
    #[error("Source {source_name} unavailable: {kind}")]
    SourceUnavailable {
        source_name: SourceName,
        kind: ErrorKind,
    },

    /// Push channel abandoned, polling fallback active (non-fatal)
    #[error("Live feed degraded to polling after {failures} failed connections")]
    TransportDegraded { failures: u32 },

    /// Backend reports the creation job failed
    #[error("Creation failed: {0}")]
    TerminalFailure(String),

    /// Network read failed outside the absorbing components
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// agmon-common error
    #[error("Common error: {0}")]
    Common(#[from] agmon_common::Error),

    /// Session was cancelled by its owner
    #[error("Session cancelled")]
    Cancelled,
}

impl MonitorError {
    /// Whether this condition ends the monitoring session
    pub fn is_session_ending(&self) -> bool {
        matches!(
            self,
            MonitorError::ResolutionTimeout { .. }
                | MonitorError::TerminalFailure(_)
                | MonitorError::Cancelled
        )
    }
}

/// Result type for monitor operations
pub type MonitorResult<T> = Result<T, MonitorError>;
