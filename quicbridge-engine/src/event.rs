//! Event payloads delivered from the engine to the session layer

use crate::handle::{CallbackToken, EngineHandle};
use crate::status::Status;
use bytes::Bytes;
use std::net::SocketAddr;

/// Acknowledgment state of one unreliable datagram send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatagramSendState {
    /// Not yet handed to the wire.
    Unknown,
    /// Handed to the wire; acknowledgment pending.
    Sent,
    /// Suspected lost; may still be acknowledged later.
    LostSuspect,
    /// Definitely lost and discarded.
    LostDiscarded,
    /// Acknowledged by the peer.
    Acknowledged,
    /// Acknowledged after having been suspected lost.
    AcknowledgedSpurious,
    /// Connection went away before delivery resolved.
    Canceled,
}

impl DatagramSendState {
    /// Whether no further transition can follow this state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DatagramSendState::LostDiscarded
                | DatagramSendState::Acknowledged
                | DatagramSendState::AcknowledgedSpurious
                | DatagramSendState::Canceled
        )
    }
}

/// Opaque peer credential material surfaced to the validation hook.
///
/// TLS itself is an external collaborator; the session layer only routes
/// this view to the application's accept/reject hook.
#[derive(Debug, Clone)]
pub struct CertificateView {
    /// DER-encoded certificate bytes.
    pub der: Bytes,
    /// Subject name, for logging and cheap checks.
    pub subject: String,
}

/// Parameters of a connection offered to a listener.
#[derive(Debug, Clone)]
pub struct NewConnectionInfo {
    /// ALPN negotiated during the handshake.
    pub negotiated_alpn: Bytes,
    /// SNI server name presented by the client.
    pub server_name: String,
    /// Local (listener-side) address.
    pub local_addr: SocketAddr,
    /// Remote (client-side) address.
    pub remote_addr: SocketAddr,
}

/// Events delivered for a connection handle.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Handshake completed.
    Connected {
        /// ALPN negotiated during the handshake.
        negotiated_alpn: Bytes,
        /// Whether the handshake resumed an earlier session.
        is_resumed: bool,
        /// Local endpoint address.
        local_addr: SocketAddr,
        /// Remote endpoint address.
        remote_addr: SocketAddr,
    },
    /// Server side only: the handshake resumed from a ticket; carries the
    /// application payload embedded when the ticket was issued.
    Resumed {
        /// Application bytes embedded in the presented ticket.
        resumption_state: Bytes,
    },
    /// Client side only: the server issued a resumption ticket.
    ResumptionTicketReceived {
        /// Opaque ticket bytes, presentable on a later connection.
        ticket: Bytes,
    },
    /// The peer certificate is available for validation. The sink's return
    /// value is the verdict: `Ok` accepts, an error status rejects.
    CertificateReceived {
        /// The peer credential material.
        certificate: CertificateView,
    },
    /// The peer opened a stream on this connection.
    IncomingStream {
        /// Engine handle of the new stream.
        stream: EngineHandle,
        /// Whether the stream is bidirectional.
        bidirectional: bool,
    },
    /// An unreliable datagram arrived. The payload is a transient view; the
    /// sink must copy what it retains before returning.
    DatagramReceived {
        /// Datagram payload.
        payload: Bytes,
        /// Whether the bytes arrived before handshake confirmation.
        zero_rtt: bool,
    },
    /// Acknowledgment state of an in-flight datagram changed.
    DatagramStateChanged {
        /// Context token supplied with the datagram send.
        context: CallbackToken,
        /// New acknowledgment state.
        state: DatagramSendState,
    },
    /// Shutdown began, locally or by the peer.
    ShutdownInitiated {
        /// Whether the peer initiated the shutdown.
        by_peer: bool,
        /// Application error code, when the shutdown carried one.
        error_code: u64,
        /// Transport status describing the cause.
        status: Status,
    },
    /// Terminal confirmation: the engine is done with this handle. No
    /// further event for the handle can follow.
    ShutdownComplete,
}

/// Events delivered for a stream handle.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// The local open completed and the stream has a wire identity.
    StartComplete {
        /// Outcome of the start.
        status: Status,
        /// Wire-level stream id.
        id: u64,
    },
    /// Ordered bytes arrived. The data is a transient view; the sink must
    /// copy what it retains before returning.
    DataReceived {
        /// Received bytes.
        data: Bytes,
        /// Whether this delivery closes the peer's send direction.
        fin: bool,
        /// Whether the bytes arrived before handshake confirmation.
        zero_rtt: bool,
    },
    /// The engine finished with the buffer of one send.
    SendComplete {
        /// Context token supplied with the send.
        context: CallbackToken,
        /// Whether the send was canceled instead of delivered.
        canceled: bool,
    },
    /// The peer gracefully closed its send direction.
    PeerSendShutdown,
    /// The peer abortively closed its send direction.
    PeerSendAborted {
        /// Application error code from the abort.
        error_code: u64,
    },
    /// Terminal confirmation for this stream handle.
    ShutdownComplete,
}

/// Events delivered for a listener handle.
#[derive(Debug, Clone)]
pub enum ListenerEvent {
    /// The engine offers an inbound connection. The sink must attach a
    /// callback token to the offered handle before returning, or reject by
    /// returning an error status (the engine then refuses the connection).
    NewConnection {
        /// Engine handle of the offered connection.
        connection: EngineHandle,
        /// Negotiated parameters of the offered connection.
        info: NewConnectionInfo,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!DatagramSendState::Unknown.is_terminal());
        assert!(!DatagramSendState::Sent.is_terminal());
        assert!(!DatagramSendState::LostSuspect.is_terminal());
        assert!(DatagramSendState::LostDiscarded.is_terminal());
        assert!(DatagramSendState::Acknowledged.is_terminal());
        assert!(DatagramSendState::AcknowledgedSpurious.is_terminal());
        assert!(DatagramSendState::Canceled.is_terminal());
    }
}
