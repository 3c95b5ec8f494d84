//! The engine boundary: entry points in, events out
//!
//! The session layer drives the engine through [`TransportEngine`] and
//! receives every asynchronous outcome through [`EventSink`]. Entry points
//! are synchronous and non-blocking; anything that takes time completes
//! through a later event carrying the callback token that was supplied with
//! the call.

use crate::event::{CertificateView, ConnectionEvent, ListenerEvent, StreamEvent};
use crate::handle::{CallbackToken, EngineHandle};
use crate::status::{EngineResult, Status};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Tunables applied to a connection before its handshake starts.
#[derive(Debug, Clone, Default)]
pub struct ConnectionParameters {
    /// Idle timeout after which the engine tears the connection down.
    pub idle_timeout: Option<Duration>,
    /// Whether unreliable datagrams are negotiated.
    pub datagrams_enabled: bool,
}

/// Per-send flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendFlags {
    /// Close the local send direction after this payload.
    pub fin: bool,
    /// Permit transmission before handshake confirmation (0-RTT) when a
    /// resumption ticket was presented.
    pub allow_zero_rtt: bool,
}

impl SendFlags {
    /// Flags for a final send that closes the send direction.
    pub fn fin() -> Self {
        Self {
            fin: true,
            allow_zero_rtt: false,
        }
    }
}

/// Callback surface the session layer hands to the engine.
///
/// The engine invokes sinks from its own worker tasks: concurrently across
/// distinct handles, serially per handle, preserving engine event order per
/// handle. Implementations must never panic into the engine; panics from
/// application hooks have to be contained on the session side.
pub trait EventSink: Send + Sync + 'static {
    /// Deliver a connection event to the object registered under `token`.
    ///
    /// For [`ConnectionEvent::CertificateReceived`] the return value is the
    /// validation verdict.
    fn on_connection_event(&self, token: CallbackToken, event: ConnectionEvent)
        -> Result<(), Status>;

    /// Deliver a stream event to the object registered under `token`.
    fn on_stream_event(&self, token: CallbackToken, event: StreamEvent) -> Result<(), Status>;

    /// Deliver a listener event to the object registered under `token`.
    fn on_listener_event(&self, token: CallbackToken, event: ListenerEvent) -> Result<(), Status>;
}

/// Entry points of the transport engine.
///
/// This is the narrow table the session layer is allowed to call; the wire
/// protocol behind it (handshake, congestion control, loss detection) is
/// opaque. Buffer-carrying calls receive a stable [`Bytes`] view from the
/// caller's lease; the engine drops its view no later than the matching
/// completion event, at which point the lease alone owns the memory again.
pub trait TransportEngine: Send + Sync + 'static {
    /// Open a process-scoped registration that owns every object created
    /// under it. Events for those objects flow through `sink`.
    fn open_registration(&self, name: &str, sink: Arc<dyn EventSink>) -> EngineResult<EngineHandle>;

    /// Release a registration. Objects created under it must be closed
    /// first.
    fn close_registration(&self, registration: EngineHandle);

    /// Create a listener under a registration.
    fn listener_open(
        &self,
        registration: EngineHandle,
        token: CallbackToken,
    ) -> EngineResult<EngineHandle>;

    /// Bind and start accepting. Returns the bound address (port 0
    /// allocates). The certificate is the opaque credential presented to
    /// connecting clients; its contents are a collaborator concern.
    fn listener_start(
        &self,
        listener: EngineHandle,
        alpn: &[u8],
        addr: SocketAddr,
        certificate: CertificateView,
    ) -> EngineResult<SocketAddr>;

    /// Stop accepting without releasing the handle.
    fn listener_stop(&self, listener: EngineHandle);

    /// Release a listener handle.
    fn listener_close(&self, listener: EngineHandle);

    /// Create an outbound connection under a registration.
    fn connection_open(
        &self,
        registration: EngineHandle,
        token: CallbackToken,
    ) -> EngineResult<EngineHandle>;

    /// Attach the callback token for a connection the engine created
    /// (listener-offered handles). Must happen before the sink returns from
    /// the offering event.
    fn connection_set_callback_token(&self, connection: EngineHandle, token: CallbackToken);

    /// Apply connection tunables. Only meaningful before the handshake
    /// starts.
    fn connection_set_parameters(
        &self,
        connection: EngineHandle,
        params: &ConnectionParameters,
    ) -> EngineResult<()>;

    /// Start the handshake toward `server_name:port`.
    fn connection_start(
        &self,
        connection: EngineHandle,
        alpn: &[u8],
        server_name: &str,
        port: u16,
    ) -> EngineResult<()>;

    /// Begin connection shutdown. Completion is signaled by
    /// [`ConnectionEvent::ShutdownComplete`].
    fn connection_shutdown(&self, connection: EngineHandle, abortive: bool, error_code: u64);

    /// Release a connection handle after shutdown completed.
    fn connection_close(&self, connection: EngineHandle);

    /// Present a resumption ticket for the next handshake (client side).
    fn set_resumption_ticket(&self, connection: EngineHandle, ticket: &[u8]) -> EngineResult<()>;

    /// Issue a resumption ticket to the peer (server side), embedding
    /// `payload` as application state returned on resumption.
    fn send_resumption_ticket(
        &self,
        connection: EngineHandle,
        is_final: bool,
        payload: &[u8],
    ) -> EngineResult<()>;

    /// Create a stream on a connection.
    fn stream_open(
        &self,
        connection: EngineHandle,
        bidirectional: bool,
        token: CallbackToken,
    ) -> EngineResult<EngineHandle>;

    /// Attach the callback token for a stream the engine created
    /// (peer-opened streams offered via
    /// [`ConnectionEvent::IncomingStream`]).
    fn stream_set_callback_token(&self, stream: EngineHandle, token: CallbackToken);

    /// Assign the stream its wire identity. Completion is signaled by
    /// [`StreamEvent::StartComplete`].
    fn stream_start(&self, stream: EngineHandle) -> EngineResult<()>;

    /// Queue ordered bytes for transmission. `context` is echoed in the
    /// matching [`StreamEvent::SendComplete`]; the engine holds `view` until
    /// that event fires.
    fn stream_send(
        &self,
        stream: EngineHandle,
        view: Bytes,
        flags: SendFlags,
        context: CallbackToken,
    ) -> EngineResult<()>;

    /// Begin stream shutdown. Graceful shutdown flushes queued sends first;
    /// abortive shutdown cancels them.
    fn stream_shutdown(&self, stream: EngineHandle, abortive: bool, error_code: u64)
        -> EngineResult<()>;

    /// Release a stream handle after shutdown completed.
    fn stream_close(&self, stream: EngineHandle);

    /// Queue one unreliable datagram. `context` is echoed in every
    /// [`ConnectionEvent::DatagramStateChanged`] for this send; the engine
    /// holds `view` until a terminal state is reported.
    fn datagram_send(
        &self,
        connection: EngineHandle,
        view: Bytes,
        context: CallbackToken,
    ) -> EngineResult<()>;
}
