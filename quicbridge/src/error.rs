//! Error types for the session layer

use quicbridge_engine::{EngineError, Status};
use thiserror::Error;

/// Main error type for session-layer operations.
///
/// Protocol-reported engine failures surface as [`QuicBridgeError::EngineCall`]
/// with the status code attached. Ownership violations (stale registry
/// tokens, double-resolved send contexts) are lifecycle bugs and panic
/// instead of appearing here.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QuicBridgeError {
    /// An engine entry point reported a non-success status.
    #[error("engine call {operation} failed: {status}")]
    EngineCall {
        /// Entry point that failed.
        operation: &'static str,
        /// Status code the engine reported.
        status: Status,
    },

    /// The handshake did not complete.
    #[error("handshake failed: {status}")]
    HandshakeFailed {
        /// Transport status describing the failure.
        status: Status,
    },

    /// The connection has shut down; the operation cannot be issued.
    #[error("connection is closed")]
    ConnectionClosed,

    /// The stream's send direction is closed (final send already issued or
    /// shutdown requested).
    #[error("stream is closed for sending")]
    StreamClosed,

    /// The send was canceled by teardown instead of completing.
    #[error("send canceled before completion")]
    SendCanceled,

    /// The listener is no longer accepting connections.
    #[error("listener is closed")]
    ListenerClosed,

    /// An operation was issued in a state that does not allow it.
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState {
        /// State the operation requires.
        expected: &'static str,
        /// State the object was in.
        actual: &'static str,
    },
}

impl From<EngineError> for QuicBridgeError {
    fn from(err: EngineError) -> Self {
        QuicBridgeError::EngineCall {
            operation: err.operation,
            status: err.status,
        }
    }
}

/// Result alias for session-layer operations.
pub type Result<T> = std::result::Result<T, QuicBridgeError>;

/// A panic captured from an application callback.
///
/// Application hooks run inside engine callbacks; a panic there must not
/// unwind into engine code, so it is caught and republished on the owning
/// object's unobserved-error channel.
#[derive(Debug, Clone)]
pub struct UnobservedError {
    /// Which hook panicked.
    pub context: String,
    /// Panic payload, rendered as text.
    pub message: String,
}

pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
