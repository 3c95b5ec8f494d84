//! # quicbridge engine boundary
//!
//! The transport-engine boundary for quicbridge: the entry-point trait the
//! session layer calls into, the event-sink trait the engine calls out
//! through, and the handle, status, buffer-lease, and event payload types
//! shared across that boundary. Also ships the in-process loopback engine
//! used by tests and local development.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod buffer;
pub mod engine;
pub mod event;
pub mod handle;
pub mod loopback;
pub mod status;

// Re-export main types
pub use buffer::BufferLease;
pub use engine::{ConnectionParameters, EventSink, SendFlags, TransportEngine};
pub use event::{
    CertificateView, ConnectionEvent, DatagramSendState, ListenerEvent, NewConnectionInfo,
    StreamEvent,
};
pub use handle::{CallbackToken, EngineHandle};
pub use loopback::LoopbackEngine;
pub use status::{EngineError, EngineResult, Status};
