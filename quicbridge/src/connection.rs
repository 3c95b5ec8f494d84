//! Peer connections: the client and server state machines
//!
//! A connection moves `Idle → Connecting → Connected → ShuttingDown →
//! Closed`, driven exclusively by engine callbacks. Application calls may
//! interleave with an in-flight callback for the same object, so every
//! mutable field sits behind a lock; the engine's per-handle serialization
//! keeps the callbacks themselves ordered.
//!
//! Resumed connections are indistinguishable from fresh ones on the
//! application surface, except for the `is_resumed` flag and (server side)
//! the resumption-state bytes recovered from the ticket.

use crate::completion::Completion;
use crate::config::{ClientConfig, ServerConfig};
use crate::datagram::DatagramSend;
use crate::error::{panic_message, QuicBridgeError, Result, UnobservedError};
use crate::registration::{Registration, RegistrationInner};
use crate::registry::RegistryEntry;
use crate::stream::{Stream, StreamCore};
use bytes::Bytes;
use parking_lot::Mutex;
use quicbridge_engine::{
    CallbackToken, CertificateView, ConnectionEvent, ConnectionParameters, DatagramSendState,
    EngineHandle, NewConnectionInfo, Status,
};
use std::fmt;
use std::net::SocketAddr;
use std::ops::Deref;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Which side of the handshake a connection is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    /// Initiated locally via [`ClientConnection::start`].
    Client,
    /// Accepted by a [`crate::Listener`].
    Server,
}

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Created, handshake not started.
    Idle,
    /// Handshake in flight.
    Connecting,
    /// Handshake completed; streams and datagrams flow.
    Connected,
    /// Shutdown requested, engine confirmation pending.
    ShuttingDown,
    /// Engine confirmed shutdown; only state queries succeed.
    Closed,
}

impl RunState {
    fn name(&self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Connecting => "connecting",
            RunState::Connected => "connected",
            RunState::ShuttingDown => "shutting down",
            RunState::Closed => "closed",
        }
    }
}

/// Connection-level notifications republished to subscribers.
#[derive(Debug, Clone)]
pub enum ConnectionNotification {
    /// The handshake completed (or resumed).
    Connected {
        /// Whether the session was resumed from a ticket.
        is_resumed: bool,
    },
    /// Client side: a resumption ticket arrived and was captured.
    ResumptionTicketReceived {
        /// The ticket bytes.
        ticket: Bytes,
    },
    /// A peer-opened stream was queued for [`PeerConnection::accept_stream`].
    IncomingStream,
    /// An unreliable datagram arrived and was queued.
    DatagramReceived {
        /// Datagram payload.
        payload: Bytes,
        /// Whether it arrived before handshake confirmation.
        zero_rtt: bool,
    },
    /// Shutdown began.
    ShutdownInitiated {
        /// Whether the peer initiated it.
        by_peer: bool,
        /// Transport status describing the cause.
        status: Status,
    },
    /// The engine confirmed shutdown; the connection is closed.
    ShutdownComplete,
}

/// A datagram received from the peer.
#[derive(Debug, Clone)]
pub struct ReceivedDatagram {
    /// Payload bytes.
    pub payload: Bytes,
    /// Whether the bytes arrived before handshake confirmation
    /// (replay-sensitive consumers should treat these differently).
    pub zero_rtt: bool,
}

/// Certificate validation hook: accept (`true`) or reject the peer
/// certificate. Runs synchronously on the engine's callback task, so it
/// must not block; a slow hook stalls that connection's handshake.
pub type CertificateValidator = Arc<dyn Fn(&CertificateView) -> bool + Send + Sync>;

pub(crate) struct ConnectionCore {
    shared: Arc<RegistrationInner>,
    role: ConnectionRole,
    alpn: Bytes,
    /// Server side: application payload embedded in issued tickets.
    resumption_payload: Bytes,
    handle: Mutex<Option<EngineHandle>>,
    token: Mutex<Option<CallbackToken>>,
    state: Mutex<RunState>,
    negotiated_alpn: Mutex<Bytes>,
    local_addr: Mutex<Option<SocketAddr>>,
    remote_addr: Mutex<Option<SocketAddr>>,
    server_name: Mutex<String>,
    is_resumed: AtomicBool,
    ticket_sent: AtomicBool,
    /// Client side: ticket presented for resumption.
    presented_ticket: Mutex<Bytes>,
    /// Client side: ticket received from the server.
    received_ticket: Mutex<Bytes>,
    /// Server side: application bytes recovered from a presented ticket.
    resumption_state: Mutex<Bytes>,
    validator: Mutex<Option<CertificateValidator>>,
    connected: Completion<std::result::Result<(), QuicBridgeError>>,
    ticket_received: Completion<Bytes>,
    closed: Completion<()>,
    finalized: AtomicBool,
    notifications: broadcast::Sender<ConnectionNotification>,
    incoming_tx: Mutex<Option<mpsc::UnboundedSender<Stream>>>,
    incoming_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Stream>>,
    datagram_tx: Mutex<Option<mpsc::UnboundedSender<ReceivedDatagram>>>,
    datagram_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ReceivedDatagram>>,
    unobserved_tx: mpsc::UnboundedSender<UnobservedError>,
    unobserved_rx: Mutex<Option<mpsc::UnboundedReceiver<UnobservedError>>>,
    /// Tokens of in-flight datagrams, canceled at teardown if the engine
    /// never resolved them.
    pending_datagrams: Mutex<Vec<CallbackToken>>,
    /// Streams belonging to this connection, finalized at teardown if
    /// their own shutdown-complete never arrived.
    children: Mutex<Vec<Weak<StreamCore>>>,
}

impl ConnectionCore {
    fn empty(shared: Arc<RegistrationInner>, role: ConnectionRole, alpn: Bytes) -> Self {
        let (notifications, _) = broadcast::channel(64);
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (datagram_tx, datagram_rx) = mpsc::unbounded_channel();
        let (unobserved_tx, unobserved_rx) = mpsc::unbounded_channel();
        Self {
            shared,
            role,
            alpn,
            resumption_payload: Bytes::new(),
            handle: Mutex::new(None),
            token: Mutex::new(None),
            state: Mutex::new(RunState::Idle),
            negotiated_alpn: Mutex::new(Bytes::new()),
            local_addr: Mutex::new(None),
            remote_addr: Mutex::new(None),
            server_name: Mutex::new(String::new()),
            is_resumed: AtomicBool::new(false),
            ticket_sent: AtomicBool::new(false),
            presented_ticket: Mutex::new(Bytes::new()),
            received_ticket: Mutex::new(Bytes::new()),
            resumption_state: Mutex::new(Bytes::new()),
            validator: Mutex::new(None),
            connected: Completion::new(),
            ticket_received: Completion::new(),
            closed: Completion::new(),
            finalized: AtomicBool::new(false),
            notifications,
            incoming_tx: Mutex::new(Some(incoming_tx)),
            incoming_rx: tokio::sync::Mutex::new(incoming_rx),
            datagram_tx: Mutex::new(Some(datagram_tx)),
            datagram_rx: tokio::sync::Mutex::new(datagram_rx),
            unobserved_tx,
            unobserved_rx: Mutex::new(Some(unobserved_rx)),
            pending_datagrams: Mutex::new(Vec::new()),
            children: Mutex::new(Vec::new()),
        }
    }

    fn client(shared: Arc<RegistrationInner>, config: &ClientConfig) -> Self {
        Self::empty(shared, ConnectionRole::Client, config.alpn.clone())
    }

    /// Server core for a listener-offered handle; the engine already
    /// negotiated the connection's parameters.
    pub(crate) fn server(
        shared: Arc<RegistrationInner>,
        config: &ServerConfig,
        handle: EngineHandle,
        info: &NewConnectionInfo,
    ) -> Self {
        let core = Self::empty(shared, ConnectionRole::Server, config.alpn.clone());
        let core = Self {
            resumption_payload: config.resumption_payload.clone(),
            ..core
        };
        *core.handle.lock() = Some(handle);
        *core.state.lock() = RunState::Connecting;
        *core.negotiated_alpn.lock() = info.negotiated_alpn.clone();
        *core.local_addr.lock() = Some(info.local_addr);
        *core.remote_addr.lock() = Some(info.remote_addr);
        *core.server_name.lock() = info.server_name.clone();
        core
    }

    pub(crate) fn shared(&self) -> &Arc<RegistrationInner> {
        &self.shared
    }

    pub(crate) fn set_token(&self, token: CallbackToken) {
        *self.token.lock() = Some(token);
    }

    pub(crate) fn is_terminating(&self) -> bool {
        matches!(*self.state.lock(), RunState::ShuttingDown | RunState::Closed)
    }

    /// Sends issued before the handshake confirms ride 0-RTT when a ticket
    /// was presented.
    pub(crate) fn allow_zero_rtt(&self) -> bool {
        self.role == ConnectionRole::Client
            && !self.presented_ticket.lock().is_empty()
            && *self.state.lock() != RunState::Connected
    }

    fn engine_handle(&self) -> Result<EngineHandle> {
        if self.finalized.load(Ordering::SeqCst) {
            return Err(QuicBridgeError::ConnectionClosed);
        }
        (*self.handle.lock()).ok_or(QuicBridgeError::ConnectionClosed)
    }

    /// Raise the `Connected` notification; idempotent per connection, so
    /// resumed handshakes (which surface both `Resumed` and `Connected`
    /// engine events) notify once.
    fn raise_connected(&self) {
        if self.connected.complete(Ok(())) {
            let is_resumed = self.is_resumed.load(Ordering::SeqCst);
            info!(role = ?self.role, is_resumed, "connection established");
            let _ = self
                .notifications
                .send(ConnectionNotification::Connected { is_resumed });
        }
    }

    pub(crate) fn on_event(this: &Arc<Self>, event: ConnectionEvent) -> std::result::Result<(), Status> {
        match event {
            ConnectionEvent::Connected {
                negotiated_alpn,
                is_resumed,
                local_addr,
                remote_addr,
            } => {
                {
                    let mut state = this.state.lock();
                    if matches!(*state, RunState::Idle | RunState::Connecting) {
                        *state = RunState::Connected;
                    }
                }
                *this.negotiated_alpn.lock() = negotiated_alpn;
                *this.local_addr.lock() = Some(local_addr);
                *this.remote_addr.lock() = Some(remote_addr);
                if is_resumed {
                    this.is_resumed.store(true, Ordering::SeqCst);
                }

                // The server finalizes ticket issuance at connect time:
                // the application payload if one was configured, else an
                // empty finalizing ticket.
                if this.role == ConnectionRole::Server
                    && !this.ticket_sent.swap(true, Ordering::SeqCst)
                {
                    if let Ok(handle) = this.engine_handle() {
                        if let Err(err) = this.shared.engine.send_resumption_ticket(
                            handle,
                            true,
                            &this.resumption_payload,
                        ) {
                            warn!(%err, "failed to issue resumption ticket");
                        }
                    }
                }
                this.raise_connected();
                Ok(())
            }

            ConnectionEvent::Resumed { resumption_state } => {
                debug!(len = resumption_state.len(), "handshake resumed from ticket");
                *this.resumption_state.lock() = resumption_state;
                this.is_resumed.store(true, Ordering::SeqCst);
                {
                    let mut state = this.state.lock();
                    if matches!(*state, RunState::Idle | RunState::Connecting) {
                        *state = RunState::Connected;
                    }
                }
                this.raise_connected();
                Ok(())
            }

            ConnectionEvent::ResumptionTicketReceived { ticket } => {
                *this.received_ticket.lock() = ticket.clone();
                if this.ticket_received.complete(ticket.clone()) {
                    debug!(len = ticket.len(), "resumption ticket captured");
                    let _ = this
                        .notifications
                        .send(ConnectionNotification::ResumptionTicketReceived { ticket });
                }
                Ok(())
            }

            ConnectionEvent::CertificateReceived { certificate } => {
                let validator = this.validator.lock().clone();
                let accepted = match validator {
                    Some(hook) => {
                        match catch_unwind(AssertUnwindSafe(|| hook(&certificate))) {
                            Ok(verdict) => verdict,
                            Err(payload) => {
                                // A panicking hook must not unwind into the
                                // engine; report it and reject the peer.
                                let message = panic_message(payload);
                                warn!(panic = %message, "certificate validator panicked");
                                let _ = this.unobserved_tx.send(UnobservedError {
                                    context: "certificate validator".to_owned(),
                                    message,
                                });
                                false
                            }
                        }
                    }
                    // Default-deny when the application supplied no hook.
                    None => false,
                };
                if accepted {
                    Ok(())
                } else {
                    Err(Status::BadCertificate)
                }
            }

            ConnectionEvent::IncomingStream {
                stream,
                bidirectional,
            } => {
                let core = Arc::new(StreamCore::incoming(Arc::clone(this), stream, bidirectional));
                let token = this
                    .shared
                    .registry
                    .register(RegistryEntry::Stream(Arc::clone(&core)));
                core.set_token(token);
                this.shared.engine.stream_set_callback_token(stream, token);
                this.children.lock().push(Arc::downgrade(&core));
                if this.finalized.load(Ordering::SeqCst) {
                    core.finalize();
                }
                debug!(%stream, bidirectional, "incoming stream");
                if let Some(tx) = this.incoming_tx.lock().as_ref() {
                    let _ = tx.send(Stream::from_core(core));
                }
                let _ = this
                    .notifications
                    .send(ConnectionNotification::IncomingStream);
                Ok(())
            }

            ConnectionEvent::DatagramReceived { payload, zero_rtt } => {
                // Transient engine view: copy before returning.
                let payload = Bytes::copy_from_slice(&payload);
                if let Some(tx) = this.datagram_tx.lock().as_ref() {
                    let _ = tx.send(ReceivedDatagram {
                        payload: payload.clone(),
                        zero_rtt,
                    });
                }
                let _ = this
                    .notifications
                    .send(ConnectionNotification::DatagramReceived { payload, zero_rtt });
                Ok(())
            }

            ConnectionEvent::DatagramStateChanged { context, state } => {
                let datagram = this.shared.registry.resolve_datagram(context);
                if datagram.transition(state) {
                    this.pending_datagrams.lock().retain(|t| *t != context);
                    this.shared.registry.unregister(context);
                }
                Ok(())
            }

            ConnectionEvent::ShutdownInitiated {
                by_peer,
                error_code,
                status,
            } => {
                debug!(by_peer, error_code, %status, "shutdown initiated");
                {
                    let mut state = this.state.lock();
                    if *state != RunState::Closed {
                        *state = RunState::ShuttingDown;
                    }
                }
                // A connection torn down before the handshake finished
                // resolves the connect waiters with the failure.
                let failure = if status.is_ok() { Status::Aborted } else { status };
                this.connected
                    .complete(Err(QuicBridgeError::HandshakeFailed { status: failure }));
                let _ = this
                    .notifications
                    .send(ConnectionNotification::ShutdownInitiated { by_peer, status });
                Ok(())
            }

            ConnectionEvent::ShutdownComplete => {
                this.finalize();
                Ok(())
            }
        }
    }

    /// Terminal cleanup, exactly once. Every outstanding completion on this
    /// connection resolves here if the engine did not resolve it earlier,
    /// and the registry entry is released as the very last action.
    pub(crate) fn finalize(&self) {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return;
        }
        let pending: Vec<CallbackToken> = self.pending_datagrams.lock().drain(..).collect();
        for token in pending {
            let datagram = self.shared.registry.resolve_datagram(token);
            if datagram.transition(DatagramSendState::Canceled) {
                self.shared.registry.unregister(token);
            }
        }
        let children: Vec<Arc<StreamCore>> = self
            .children
            .lock()
            .drain(..)
            .filter_map(|weak| weak.upgrade())
            .collect();
        for child in children {
            child.finalize();
        }

        *self.state.lock() = RunState::Closed;
        self.connected
            .complete(Err(QuicBridgeError::ConnectionClosed));
        // Closing the queues unblocks accept/recv callers with an error.
        self.incoming_tx.lock().take();
        self.datagram_tx.lock().take();
        let _ = self
            .notifications
            .send(ConnectionNotification::ShutdownComplete);
        self.closed.complete(());

        if let Some(handle) = *self.handle.lock() {
            self.shared.engine.connection_close(handle);
        }
        if let Some(token) = self.token.lock().take() {
            self.shared.registry.unregister(token);
        }
        debug!(role = ?self.role, "connection finalized");
    }

    fn request_shutdown(&self, abortive: bool, error_code: u64) {
        let prior = {
            let mut state = self.state.lock();
            let prior = *state;
            if matches!(
                prior,
                RunState::Idle | RunState::Connecting | RunState::Connected
            ) {
                *state = RunState::ShuttingDown;
            }
            prior
        };
        match prior {
            RunState::ShuttingDown | RunState::Closed => {}
            // Never started: no engine confirmation will come, finish here.
            RunState::Idle => self.finalize(),
            _ => match *self.handle.lock() {
                Some(handle) => {
                    self.shared
                        .engine
                        .connection_shutdown(handle, abortive, error_code)
                }
                None => self.finalize(),
            },
        }
    }

    fn open_stream(this: &Arc<Self>, bidirectional: bool) -> Result<Stream> {
        if this.is_terminating() {
            return Err(QuicBridgeError::ConnectionClosed);
        }
        let conn_handle = this.engine_handle()?;
        let core = Arc::new(StreamCore::new(Arc::clone(this), bidirectional));
        let token = this
            .shared
            .registry
            .register(RegistryEntry::Stream(Arc::clone(&core)));
        core.set_token(token);

        let handle = match this
            .shared
            .engine
            .stream_open(conn_handle, bidirectional, token)
        {
            Ok(handle) => handle,
            Err(err) => {
                this.shared.registry.unregister(token);
                return Err(err.into());
            }
        };
        core.set_handle(handle);
        this.children.lock().push(Arc::downgrade(&core));
        if this.finalized.load(Ordering::SeqCst) {
            core.finalize();
            return Err(QuicBridgeError::ConnectionClosed);
        }

        if let Err(err) = this.shared.engine.stream_start(handle) {
            core.finalize();
            return Err(err.into());
        }
        Ok(Stream::from_core(core))
    }

    fn send_datagram(this: &Arc<Self>, datagram: &DatagramSend) -> Result<()> {
        if this.is_terminating() {
            return Err(QuicBridgeError::ConnectionClosed);
        }
        let handle = this.engine_handle()?;
        datagram.mark_issued()?;
        let inner = datagram.inner();
        let view = inner.lease_view().ok_or(QuicBridgeError::InvalidState {
            expected: "unsent datagram",
            actual: "buffer already released",
        })?;
        let token = this
            .shared
            .registry
            .register(RegistryEntry::Datagram(Arc::clone(&inner)));
        this.pending_datagrams.lock().push(token);

        if let Err(err) = this.shared.engine.datagram_send(handle, view, token) {
            this.pending_datagrams.lock().retain(|t| *t != token);
            this.shared.registry.unregister(token);
            return Err(err.into());
        }
        // Teardown may have drained the pending list between the state
        // check and the push; resolve the straggler as canceled.
        if this.finalized.load(Ordering::SeqCst) {
            let mut pending = this.pending_datagrams.lock();
            if let Some(position) = pending.iter().position(|t| *t == token) {
                pending.remove(position);
                drop(pending);
                if inner.transition(DatagramSendState::Canceled) {
                    this.shared.registry.unregister(token);
                }
            }
        }
        Ok(())
    }
}

/// Shared application surface of a connection, independent of role.
///
/// Obtained through [`ClientConnection`] or [`ServerConnection`], both of
/// which deref to this type. Dropping the owning handle requests a graceful
/// shutdown; in-flight completions still resolve through callbacks.
pub struct PeerConnection {
    core: Arc<ConnectionCore>,
}

impl PeerConnection {
    /// Which side of the handshake this connection is.
    pub fn role(&self) -> ConnectionRole {
        self.core.role
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RunState {
        *self.core.state.lock()
    }

    /// ALPN negotiated during the handshake (empty before `Connected`).
    pub fn negotiated_alpn(&self) -> Bytes {
        self.core.negotiated_alpn.lock().clone()
    }

    /// Local endpoint address, once known.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.core.local_addr.lock()
    }

    /// Remote endpoint address, once known.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        *self.core.remote_addr.lock()
    }

    /// Whether the handshake resumed an earlier session.
    pub fn is_resumed(&self) -> bool {
        self.core.is_resumed.load(Ordering::SeqCst)
    }

    /// Suspend until the handshake completes; resolves with the handshake
    /// failure if the connection tore down first.
    pub async fn connected(&self) -> Result<()> {
        self.core.connected.wait().await
    }

    /// Subscribe to connection notifications.
    pub fn notifications(&self) -> broadcast::Receiver<ConnectionNotification> {
        self.core.notifications.subscribe()
    }

    /// Install the certificate validation hook. Without one, every peer
    /// certificate is rejected.
    pub fn set_certificate_validator<F>(&self, hook: F)
    where
        F: Fn(&CertificateView) -> bool + Send + Sync + 'static,
    {
        *self.core.validator.lock() = Some(Arc::new(hook));
    }

    /// Take the unobserved-error channel: panics captured from application
    /// hooks are republished here. Can be taken once.
    pub fn unobserved_errors(&self) -> Option<mpsc::UnboundedReceiver<UnobservedError>> {
        self.core.unobserved_rx.lock().take()
    }

    /// Open a stream. Permitted before the handshake completes: with a
    /// presented resumption ticket such early sends ride 0-RTT.
    pub fn open_stream(&self, bidirectional: bool) -> Result<Stream> {
        ConnectionCore::open_stream(&self.core, bidirectional)
    }

    /// Receive the next peer-opened stream.
    pub async fn accept_stream(&self) -> Result<Stream> {
        self.core
            .incoming_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(QuicBridgeError::ConnectionClosed)
    }

    /// Hand a datagram to the engine. The datagram's completions and
    /// state-change subscription track its fate from here.
    pub fn send_datagram(&self, datagram: &DatagramSend) -> Result<()> {
        ConnectionCore::send_datagram(&self.core, datagram)
    }

    /// Receive the next datagram from the peer.
    pub async fn recv_datagram(&self) -> Result<ReceivedDatagram> {
        self.core
            .datagram_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(QuicBridgeError::ConnectionClosed)
    }

    /// Request a graceful shutdown and return immediately; completion
    /// arrives via [`ConnectionNotification::ShutdownComplete`].
    pub fn close(&self) {
        self.core.request_shutdown(false, 0);
    }

    /// Request an abortive shutdown carrying an application error code.
    pub fn abort(&self, error_code: u64) {
        self.core.request_shutdown(true, error_code);
    }

    /// Request shutdown (if not already requested) and suspend until the
    /// engine confirms it.
    pub async fn shutdown(&self) {
        self.core.request_shutdown(false, 0);
        self.core.closed.wait().await;
    }

    /// Whether shutdown has been confirmed.
    pub fn is_closed(&self) -> bool {
        *self.core.state.lock() == RunState::Closed
    }

    fn core(&self) -> &Arc<ConnectionCore> {
        &self.core
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        self.core.request_shutdown(false, 0);
    }
}

impl fmt::Display for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let role = match self.core.role {
            ConnectionRole::Client => "ClientConnection",
            ConnectionRole::Server => "ServerConnection",
        };
        match *self.core.handle.lock() {
            Some(handle) => write!(f, "[{role} {handle}]"),
            None => write!(f, "[{role} unopened]"),
        }
    }
}

/// An outbound connection.
pub struct ClientConnection {
    peer: PeerConnection,
}

impl ClientConnection {
    /// Create a client connection under a registration. The handshake does
    /// not start until [`ClientConnection::start`].
    pub fn new(registration: &Registration, config: ClientConfig) -> Result<Self> {
        let shared = registration.shared();
        let core = Arc::new(ConnectionCore::client(Arc::clone(&shared), &config));
        let token = shared
            .registry
            .register(RegistryEntry::Connection(Arc::clone(&core)));
        *core.token.lock() = Some(token);

        let abandon = |core: &ConnectionCore, token: CallbackToken| {
            core.token.lock().take();
            shared.registry.unregister(token);
        };

        let handle = match shared.engine.connection_open(shared.handle, token) {
            Ok(handle) => handle,
            Err(err) => {
                abandon(&core, token);
                return Err(err.into());
            }
        };
        *core.handle.lock() = Some(handle);

        let params = ConnectionParameters {
            idle_timeout: Some(config.idle_timeout),
            datagrams_enabled: config.datagrams_enabled,
        };
        if let Err(err) = shared.engine.connection_set_parameters(handle, &params) {
            shared.engine.connection_close(handle);
            abandon(&core, token);
            return Err(err.into());
        }

        let connection = Self {
            peer: PeerConnection { core },
        };
        if let Some(ticket) = config.resumption_ticket {
            connection.set_resumption_ticket(ticket)?;
        }
        Ok(connection)
    }

    /// Start the handshake toward `server_name:port`.
    pub fn start(&self, server_name: &str, port: u16) -> Result<()> {
        let core = self.peer.core();
        {
            let mut state = core.state.lock();
            if *state != RunState::Idle {
                return Err(QuicBridgeError::InvalidState {
                    expected: "idle",
                    actual: state.name(),
                });
            }
            *state = RunState::Connecting;
        }
        let handle = core.engine_handle()?;
        if let Err(err) = core
            .shared
            .engine
            .connection_start(handle, &core.alpn, server_name, port)
        {
            *core.state.lock() = RunState::Idle;
            return Err(err.into());
        }
        debug!(server_name, port, "handshake started");
        Ok(())
    }

    /// Present a resumption ticket for this connection's handshake,
    /// enabling 0-RTT sends issued before `Connected`. Must be called
    /// before [`ClientConnection::start`].
    pub fn set_resumption_ticket(&self, ticket: Bytes) -> Result<()> {
        let core = self.peer.core();
        let handle = core.engine_handle()?;
        core.shared.engine.set_resumption_ticket(handle, &ticket)?;
        *core.presented_ticket.lock() = ticket;
        Ok(())
    }

    /// The resumption ticket received from the server, empty until one
    /// arrives. A client may persist it and present it on a later
    /// connection to request 0-RTT.
    pub fn resumption_ticket(&self) -> Bytes {
        self.peer.core().received_ticket.lock().clone()
    }

    /// Suspend until the server issues a resumption ticket.
    pub async fn wait_resumption_ticket(&self) -> Bytes {
        self.peer.core().ticket_received.wait().await
    }
}

impl Deref for ClientConnection {
    type Target = PeerConnection;

    fn deref(&self) -> &PeerConnection {
        &self.peer
    }
}

impl fmt::Display for ClientConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.peer.fmt(f)
    }
}

/// A connection accepted by a [`crate::Listener`].
pub struct ServerConnection {
    peer: PeerConnection,
}

impl ServerConnection {
    pub(crate) fn from_core(core: Arc<ConnectionCore>) -> Self {
        Self {
            peer: PeerConnection { core },
        }
    }

    /// SNI server name the client presented.
    pub fn server_name(&self) -> String {
        self.peer.core().server_name.lock().clone()
    }

    /// Application bytes recovered from the client's resumption ticket;
    /// empty unless the handshake resumed.
    pub fn resumption_state(&self) -> Bytes {
        self.peer.core().resumption_state.lock().clone()
    }
}

impl Deref for ServerConnection {
    type Target = PeerConnection;

    fn deref(&self) -> &PeerConnection {
        &self.peer
    }
}

impl fmt::Display for ServerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.peer.fmt(f)
    }
}
