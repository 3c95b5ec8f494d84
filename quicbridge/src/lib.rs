//! # quicbridge
//!
//! A managed session layer over a QUIC transport engine: connections,
//! ordered streams, and unreliable datagrams, with the engine's
//! callback-driven lifecycle bridged into owned Rust objects.
//!
//! The engine itself (handshake, congestion control, loss detection) is
//! an external collaborator behind the [`quicbridge_engine::TransportEngine`]
//! boundary. This crate owns everything around it: the connection and
//! stream state machines, buffer-ownership handoff for in-flight sends, the
//! datagram acknowledgment state machine, and the handle registry that
//! routes engine callbacks to the right object without races or
//! use-after-free.
//!
//! A typical server:
//!
//! ```rust,no_run
//! use quicbridge::{Credentials, Listener, Registration, ServerConfig};
//! use quicbridge_engine::LoopbackEngine;
//! use std::sync::Arc;
//!
//! # async fn example() -> quicbridge::Result<()> {
//! let engine = Arc::new(LoopbackEngine::new());
//! let registration = Registration::new(engine, "example")?;
//! let config = ServerConfig::new("example/1", Credentials::self_signed("localhost"));
//! let listener = Listener::new(&registration, config)?;
//! listener.start("127.0.0.1:0".parse().unwrap())?;
//! let connection = listener.accept().await?;
//! let stream = connection.accept_stream().await?;
//! stream.readable().await;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

mod completion;
pub mod config;
pub mod connection;
pub mod datagram;
pub mod error;
pub mod listener;
pub mod registration;
mod registry;
pub mod stream;

// Re-export main types
pub use config::{ClientConfig, Credentials, ServerConfig};
pub use connection::{
    CertificateValidator, ClientConnection, ConnectionNotification, ConnectionRole,
    PeerConnection, ReceivedDatagram, RunState, ServerConnection,
};
pub use datagram::{DatagramOutcome, DatagramSend};
pub use error::{QuicBridgeError, Result, UnobservedError};
pub use listener::{Listener, ListenerNotification};
pub use registration::Registration;
pub use stream::{PendingSend, Stream, StreamNotification};

// The engine-boundary types that appear in this crate's API surface.
pub use quicbridge_engine::{CertificateView, DatagramSendState, SendFlags, Status};
