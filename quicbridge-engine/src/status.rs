//! Engine status codes and entry-point errors

use std::fmt;
use thiserror::Error;

/// Status codes reported by the transport engine.
///
/// Entry points surface non-success codes through [`EngineError`]; event
/// sinks return a `Result<(), Status>` so callback handlers (certificate
/// validation in particular) can hand a verdict back to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Operation completed.
    Success,
    /// Operation was accepted and will complete through a later event.
    Pending,
    /// Operation was aborted locally.
    Aborted,
    /// The target object is not in a state that allows the operation.
    InvalidState,
    /// The peer (or listener policy) refused the connection.
    ConnectionRefused,
    /// The connection timed out while idle.
    ConnectionIdle,
    /// The peer certificate was rejected.
    BadCertificate,
    /// No engine object exists for the given handle or address.
    NotFound,
    /// Unspecified engine-internal failure.
    InternalError,
}

impl Status {
    /// Whether this code reports success (including pending completion).
    pub fn is_ok(&self) -> bool {
        matches!(self, Status::Success | Status::Pending)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Success => "success",
            Status::Pending => "pending",
            Status::Aborted => "aborted",
            Status::InvalidState => "invalid state",
            Status::ConnectionRefused => "connection refused",
            Status::ConnectionIdle => "connection idle",
            Status::BadCertificate => "bad certificate",
            Status::NotFound => "not found",
            Status::InternalError => "internal error",
        };
        f.write_str(name)
    }
}

/// Failure returned by a [`crate::TransportEngine`] entry point.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("engine call {operation} failed: {status}")]
pub struct EngineError {
    /// Entry point that failed.
    pub operation: &'static str,
    /// Status code the engine reported.
    pub status: Status,
}

impl EngineError {
    /// Build an error for a failed entry point.
    pub fn new(operation: &'static str, status: Status) -> Self {
        Self { operation, status }
    }
}

/// Result alias for entry points.
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_counts_as_ok() {
        assert!(Status::Success.is_ok());
        assert!(Status::Pending.is_ok());
        assert!(!Status::ConnectionRefused.is_ok());
    }

    #[test]
    fn error_carries_operation_and_status() {
        let err = EngineError::new("connection_start", Status::NotFound);
        assert_eq!(err.to_string(), "engine call connection_start failed: not found");
    }
}
