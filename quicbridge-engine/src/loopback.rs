//! In-process loopback engine
//!
//! A deterministic [`TransportEngine`] that connects endpoints inside one
//! process: listeners are keyed by socket address, each established
//! connection pair is driven by a single worker task (which is what makes
//! event delivery serial per handle), resumption tickets are random bytes
//! recorded in an engine-side table, and datagrams are acknowledged as soon
//! as they are delivered. It implements the engine *interface*, not QUIC:
//! there is no wire, no congestion control, and no cryptography behind it.
//!
//! Entry points are callable from any thread, but the engine spawns its
//! worker tasks on the ambient tokio runtime, so connections must be
//! started from within one.

use crate::engine::{ConnectionParameters, EventSink, SendFlags, TransportEngine};
use crate::event::{
    CertificateView, ConnectionEvent, DatagramSendState, ListenerEvent, NewConnectionInfo,
    StreamEvent,
};
use crate::handle::{CallbackToken, EngineHandle};
use crate::status::{EngineError, EngineResult, Status};
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::RngCore;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// The in-process engine. Cheap to clone via [`Arc`]; one instance is the
/// whole "network".
#[derive(Clone)]
pub struct LoopbackEngine {
    inner: Arc<Inner>,
}

struct Inner {
    registrations: DashMap<EngineHandle, Arc<RegistrationEntry>>,
    /// Started listeners, keyed by bound port.
    listeners: DashMap<u16, Arc<ListenerEntry>>,
    /// All listener handles, including not-yet-started ones.
    listener_handles: DashMap<EngineHandle, Arc<PendingListener>>,
    connections: DashMap<EngineHandle, Arc<ConnEntry>>,
    streams: DashMap<EngineHandle, Arc<StreamEntry>>,
    /// Issued resumption tickets: ticket bytes -> issuing endpoint.
    tickets: DashMap<Vec<u8>, TicketEntry>,
    next_port: AtomicU16,
    next_stream_id: AtomicU64,
}

struct RegistrationEntry {
    sink: Arc<dyn EventSink>,
    name: String,
}

struct PendingListener {
    registration: EngineHandle,
    token: CallbackToken,
    port: Mutex<Option<u16>>,
}

struct ListenerEntry {
    token: CallbackToken,
    alpn: Vec<u8>,
    addr: SocketAddr,
    sink: Arc<dyn EventSink>,
    certificate: CertificateView,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Role {
    Client,
    Server,
}

struct ConnEntry {
    sink: Arc<dyn EventSink>,
    token: Mutex<Option<CallbackToken>>,
    role: Role,
    cmd_tx: mpsc::UnboundedSender<Cmd>,
    /// Client side only: taken by the pair task at connection start.
    cmd_rx: Mutex<Option<mpsc::UnboundedReceiver<Cmd>>>,
    /// Client-presented resumption ticket.
    ticket: Mutex<Option<Vec<u8>>>,
    started: AtomicBool,
}

struct StreamEntry {
    conn: EngineHandle,
    sink: Arc<dyn EventSink>,
    token: Mutex<Option<CallbackToken>>,
    bidirectional: bool,
    peer: Mutex<Option<EngineHandle>>,
}

struct TicketEntry {
    port: u16,
    alpn: Vec<u8>,
    /// Application payload embedded by the issuing server.
    payload: Vec<u8>,
}

enum Cmd {
    StreamStart {
        stream: EngineHandle,
    },
    StreamSend {
        stream: EngineHandle,
        data: Bytes,
        flags: SendFlags,
        context: CallbackToken,
    },
    StreamShutdown {
        stream: EngineHandle,
        abortive: bool,
        error_code: u64,
    },
    DatagramSend {
        conn: EngineHandle,
        data: Bytes,
        context: CallbackToken,
    },
    SendTicket {
        conn: EngineHandle,
        payload: Bytes,
    },
    ConnShutdown {
        conn: EngineHandle,
        abortive: bool,
        error_code: u64,
    },
}

impl LoopbackEngine {
    /// Create an empty in-process network.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                registrations: DashMap::new(),
                listeners: DashMap::new(),
                listener_handles: DashMap::new(),
                connections: DashMap::new(),
                streams: DashMap::new(),
                tickets: DashMap::new(),
                next_port: AtomicU16::new(40000),
                next_stream_id: AtomicU64::new(0),
            }),
        }
    }
}

impl Default for LoopbackEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn alloc_port(&self) -> u16 {
        self.next_port.fetch_add(1, Ordering::Relaxed)
    }

    fn conn(&self, handle: EngineHandle) -> Option<Arc<ConnEntry>> {
        self.connections.get(&handle).map(|r| Arc::clone(&r))
    }

    fn stream(&self, handle: EngineHandle) -> Option<Arc<StreamEntry>> {
        self.streams.get(&handle).map(|r| Arc::clone(&r))
    }

    fn conn_event(&self, handle: EngineHandle, event: ConnectionEvent) -> Result<(), Status> {
        let Some(entry) = self.conn(handle) else {
            return Ok(());
        };
        let token = *entry.token.lock();
        match token {
            Some(token) => entry.sink.on_connection_event(token, event),
            None => {
                warn!(%handle, "dropping connection event: no callback token attached");
                Ok(())
            }
        }
    }

    fn stream_event(&self, handle: EngineHandle, event: StreamEvent) {
        let Some(entry) = self.stream(handle) else {
            return;
        };
        let token = *entry.token.lock();
        match token {
            Some(token) => {
                let _ = entry.sink.on_stream_event(token, event);
            }
            None => warn!(%handle, "dropping stream event: no callback token attached"),
        }
    }

    /// All live stream handles belonging to either endpoint of a pair.
    fn streams_of(&self, a: EngineHandle, b: Option<EngineHandle>) -> Vec<EngineHandle> {
        self.streams
            .iter()
            .filter(|r| r.conn == a || Some(r.conn) == b)
            .map(|r| *r.key())
            .collect()
    }
}

impl TransportEngine for LoopbackEngine {
    fn open_registration(&self, name: &str, sink: Arc<dyn EventSink>) -> EngineResult<EngineHandle> {
        let handle = EngineHandle::fresh();
        debug!(%handle, name, "opening registration");
        self.inner.registrations.insert(
            handle,
            Arc::new(RegistrationEntry {
                sink,
                name: name.to_owned(),
            }),
        );
        Ok(handle)
    }

    fn close_registration(&self, registration: EngineHandle) {
        if let Some((_, entry)) = self.inner.registrations.remove(&registration) {
            debug!(%registration, name = %entry.name, "closed registration");
        }
    }

    fn listener_open(
        &self,
        registration: EngineHandle,
        token: CallbackToken,
    ) -> EngineResult<EngineHandle> {
        if !self.inner.registrations.contains_key(&registration) {
            return Err(EngineError::new("listener_open", Status::NotFound));
        }
        let handle = EngineHandle::fresh();
        self.inner.listener_handles.insert(
            handle,
            Arc::new(PendingListener {
                registration,
                token,
                port: Mutex::new(None),
            }),
        );
        Ok(handle)
    }

    fn listener_start(
        &self,
        listener: EngineHandle,
        alpn: &[u8],
        addr: SocketAddr,
        certificate: CertificateView,
    ) -> EngineResult<SocketAddr> {
        let pending = self
            .inner
            .listener_handles
            .get(&listener)
            .map(|r| Arc::clone(&r))
            .ok_or_else(|| EngineError::new("listener_start", Status::NotFound))?;
        let registration = self
            .inner
            .registrations
            .get(&pending.registration)
            .map(|r| Arc::clone(&r))
            .ok_or_else(|| EngineError::new("listener_start", Status::NotFound))?;

        let port = if addr.port() == 0 {
            self.inner.alloc_port()
        } else {
            addr.port()
        };
        let bound = SocketAddr::new(addr.ip(), port);
        let entry = Arc::new(ListenerEntry {
            token: pending.token,
            alpn: alpn.to_vec(),
            addr: bound,
            sink: Arc::clone(&registration.sink),
            certificate,
        });
        if self.inner.listeners.insert(port, entry).is_some() {
            warn!(port, "listener port rebound");
        }
        *pending.port.lock() = Some(port);
        debug!(%listener, %bound, "listener started");
        Ok(bound)
    }

    fn listener_stop(&self, listener: EngineHandle) {
        if let Some(pending) = self.inner.listener_handles.get(&listener) {
            if let Some(port) = pending.port.lock().take() {
                self.inner.listeners.remove(&port);
                debug!(%listener, port, "listener stopped");
            }
        }
    }

    fn listener_close(&self, listener: EngineHandle) {
        self.listener_stop(listener);
        self.inner.listener_handles.remove(&listener);
    }

    fn connection_open(
        &self,
        registration: EngineHandle,
        token: CallbackToken,
    ) -> EngineResult<EngineHandle> {
        let reg = self
            .inner
            .registrations
            .get(&registration)
            .map(|r| Arc::clone(&r))
            .ok_or_else(|| EngineError::new("connection_open", Status::NotFound))?;
        let handle = EngineHandle::fresh();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        self.inner.connections.insert(
            handle,
            Arc::new(ConnEntry {
                sink: Arc::clone(&reg.sink),
                token: Mutex::new(Some(token)),
                role: Role::Client,
                cmd_tx,
                cmd_rx: Mutex::new(Some(cmd_rx)),
                ticket: Mutex::new(None),
                started: AtomicBool::new(false),
            }),
        );
        debug!(%handle, "connection opened");
        Ok(handle)
    }

    fn connection_set_callback_token(&self, connection: EngineHandle, token: CallbackToken) {
        if let Some(entry) = self.inner.conn(connection) {
            *entry.token.lock() = Some(token);
        }
    }

    fn connection_set_parameters(
        &self,
        connection: EngineHandle,
        params: &ConnectionParameters,
    ) -> EngineResult<()> {
        let entry = self
            .inner
            .conn(connection)
            .ok_or_else(|| EngineError::new("connection_set_parameters", Status::NotFound))?;
        if entry.started.load(Ordering::SeqCst) {
            return Err(EngineError::new(
                "connection_set_parameters",
                Status::InvalidState,
            ));
        }
        // The loopback wire has no idle clock or datagram negotiation to
        // configure; accepting the call keeps the entry-point table honest.
        trace!(%connection, ?params, "connection parameters applied");
        Ok(())
    }

    fn connection_start(
        &self,
        connection: EngineHandle,
        alpn: &[u8],
        server_name: &str,
        port: u16,
    ) -> EngineResult<()> {
        let entry = self
            .inner
            .conn(connection)
            .ok_or_else(|| EngineError::new("connection_start", Status::NotFound))?;
        if entry.started.swap(true, Ordering::SeqCst) {
            return Err(EngineError::new("connection_start", Status::InvalidState));
        }
        let rx = entry
            .cmd_rx
            .lock()
            .take()
            .ok_or_else(|| EngineError::new("connection_start", Status::InvalidState))?;
        debug!(%connection, server_name, port, "connection starting");
        let inner = Arc::clone(&self.inner);
        let alpn = alpn.to_vec();
        tokio::spawn(run_pair(inner, connection, alpn, port, rx));
        Ok(())
    }

    fn connection_shutdown(&self, connection: EngineHandle, abortive: bool, error_code: u64) {
        if let Some(entry) = self.inner.conn(connection) {
            let _ = entry.cmd_tx.send(Cmd::ConnShutdown {
                conn: connection,
                abortive,
                error_code,
            });
        }
    }

    fn connection_close(&self, connection: EngineHandle) {
        if self.inner.connections.remove(&connection).is_some() {
            trace!(%connection, "connection handle released");
        }
    }

    fn set_resumption_ticket(&self, connection: EngineHandle, ticket: &[u8]) -> EngineResult<()> {
        let entry = self
            .inner
            .conn(connection)
            .ok_or_else(|| EngineError::new("set_resumption_ticket", Status::NotFound))?;
        if entry.started.load(Ordering::SeqCst) {
            return Err(EngineError::new("set_resumption_ticket", Status::InvalidState));
        }
        *entry.ticket.lock() = Some(ticket.to_vec());
        Ok(())
    }

    fn send_resumption_ticket(
        &self,
        connection: EngineHandle,
        _is_final: bool,
        payload: &[u8],
    ) -> EngineResult<()> {
        let entry = self
            .inner
            .conn(connection)
            .ok_or_else(|| EngineError::new("send_resumption_ticket", Status::NotFound))?;
        if entry.role != Role::Server {
            return Err(EngineError::new("send_resumption_ticket", Status::InvalidState));
        }
        let _ = entry.cmd_tx.send(Cmd::SendTicket {
            conn: connection,
            payload: Bytes::copy_from_slice(payload),
        });
        Ok(())
    }

    fn stream_open(
        &self,
        connection: EngineHandle,
        bidirectional: bool,
        token: CallbackToken,
    ) -> EngineResult<EngineHandle> {
        let conn = self
            .inner
            .conn(connection)
            .ok_or_else(|| EngineError::new("stream_open", Status::NotFound))?;
        let handle = EngineHandle::fresh();
        self.inner.streams.insert(
            handle,
            Arc::new(StreamEntry {
                conn: connection,
                sink: Arc::clone(&conn.sink),
                token: Mutex::new(Some(token)),
                bidirectional,
                peer: Mutex::new(None),
            }),
        );
        trace!(%handle, %connection, "stream opened");
        Ok(handle)
    }

    fn stream_set_callback_token(&self, stream: EngineHandle, token: CallbackToken) {
        if let Some(entry) = self.inner.stream(stream) {
            *entry.token.lock() = Some(token);
        }
    }

    fn stream_start(&self, stream: EngineHandle) -> EngineResult<()> {
        let entry = self
            .inner
            .stream(stream)
            .ok_or_else(|| EngineError::new("stream_start", Status::NotFound))?;
        let conn = self
            .inner
            .conn(entry.conn)
            .ok_or_else(|| EngineError::new("stream_start", Status::NotFound))?;
        let _ = conn.cmd_tx.send(Cmd::StreamStart { stream });
        Ok(())
    }

    fn stream_send(
        &self,
        stream: EngineHandle,
        view: Bytes,
        flags: SendFlags,
        context: CallbackToken,
    ) -> EngineResult<()> {
        let entry = self
            .inner
            .stream(stream)
            .ok_or_else(|| EngineError::new("stream_send", Status::NotFound))?;
        let conn = self
            .inner
            .conn(entry.conn)
            .ok_or_else(|| EngineError::new("stream_send", Status::NotFound))?;
        let _ = conn.cmd_tx.send(Cmd::StreamSend {
            stream,
            data: view,
            flags,
            context,
        });
        Ok(())
    }

    fn stream_shutdown(
        &self,
        stream: EngineHandle,
        abortive: bool,
        error_code: u64,
    ) -> EngineResult<()> {
        let entry = self
            .inner
            .stream(stream)
            .ok_or_else(|| EngineError::new("stream_shutdown", Status::NotFound))?;
        let conn = self
            .inner
            .conn(entry.conn)
            .ok_or_else(|| EngineError::new("stream_shutdown", Status::NotFound))?;
        let _ = conn.cmd_tx.send(Cmd::StreamShutdown {
            stream,
            abortive,
            error_code,
        });
        Ok(())
    }

    fn stream_close(&self, stream: EngineHandle) {
        if self.inner.streams.remove(&stream).is_some() {
            trace!(%stream, "stream handle released");
        }
    }

    fn datagram_send(
        &self,
        connection: EngineHandle,
        view: Bytes,
        context: CallbackToken,
    ) -> EngineResult<()> {
        let conn = self
            .inner
            .conn(connection)
            .ok_or_else(|| EngineError::new("datagram_send", Status::NotFound))?;
        let _ = conn.cmd_tx.send(Cmd::DatagramSend {
            conn: connection,
            data: view,
            context,
        });
        Ok(())
    }
}

/// Wire-direction bookkeeping for one stream handle.
#[derive(Default)]
struct StreamWire {
    fin_sent: bool,
    fin_received: bool,
    shutdown_done: bool,
}

/// State owned by one connection pair's worker task.
struct Pair {
    inner: Arc<Inner>,
    client: EngineHandle,
    server: Option<EngineHandle>,
    port: u16,
    alpn: Vec<u8>,
    resumed: bool,
    handshake_confirmed: bool,
    wires: HashMap<EngineHandle, StreamWire>,
    closing: bool,
}

/// Drives one connection pair. Being the only task that delivers events for
/// the pair's handles is what guarantees serial per-handle delivery.
async fn run_pair(
    inner: Arc<Inner>,
    client: EngineHandle,
    alpn: Vec<u8>,
    port: u16,
    mut rx: mpsc::UnboundedReceiver<Cmd>,
) {
    let mut pair = Pair {
        inner,
        client,
        server: None,
        port,
        alpn: alpn.clone(),
        resumed: false,
        handshake_confirmed: false,
        wires: HashMap::new(),
        closing: false,
    };

    // Commands issued between connection_start and now are the 0-RTT
    // candidates; everything later is post-handshake.
    let mut early = Vec::new();
    while let Ok(cmd) = rx.try_recv() {
        early.push(cmd);
    }

    match pair.handshake(&alpn, port) {
        Ok(()) => {}
        Err(status) => {
            pair.fail_connect(status, early, rx).await;
            return;
        }
    }

    for cmd in early {
        if pair.process(cmd) {
            pair.drain_after_teardown(rx).await;
            return;
        }
    }
    pair.handshake_confirmed = true;

    while let Some(cmd) = rx.recv().await {
        if pair.process(cmd) {
            break;
        }
    }
    pair.drain_after_teardown(rx).await;
}

impl Pair {
    /// Connect dance: certificate check, listener offer, resumed/connected
    /// events, in that order.
    fn handshake(&mut self, alpn: &[u8], port: u16) -> Result<(), Status> {
        let listener = self
            .inner
            .listeners
            .get(&port)
            .map(|r| Arc::clone(&r))
            .ok_or(Status::ConnectionRefused)?;
        if listener.alpn != alpn {
            return Err(Status::ConnectionRefused);
        }

        // Client-side certificate validation verdict gates the handshake.
        self.inner.conn_event(
            self.client,
            ConnectionEvent::CertificateReceived {
                certificate: listener.certificate.clone(),
            },
        )?;

        let client_entry = self.inner.conn(self.client).ok_or(Status::Aborted)?;
        let client_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), self.inner.alloc_port());

        // Resumption: a known ticket for this endpoint resumes the session.
        let mut resumption_state = Bytes::new();
        if let Some(ticket) = client_entry.ticket.lock().clone() {
            if let Some(entry) = self.inner.tickets.get(&ticket) {
                if entry.port == port && entry.alpn == alpn {
                    self.resumed = true;
                    resumption_state = Bytes::copy_from_slice(&entry.payload);
                }
            }
        }

        let server = EngineHandle::fresh();
        self.inner.connections.insert(
            server,
            Arc::new(ConnEntry {
                sink: Arc::clone(&listener.sink),
                token: Mutex::new(None),
                role: Role::Server,
                cmd_tx: client_entry.cmd_tx.clone(),
                cmd_rx: Mutex::new(None),
                ticket: Mutex::new(None),
                started: AtomicBool::new(true),
            }),
        );

        let info = NewConnectionInfo {
            negotiated_alpn: Bytes::copy_from_slice(alpn),
            server_name: listener.addr.ip().to_string(),
            local_addr: listener.addr,
            remote_addr: client_addr,
        };
        // The sink attaches the server connection's callback token before
        // returning; an error refuses the connection.
        if listener
            .sink
            .on_listener_event(
                listener.token,
                ListenerEvent::NewConnection {
                    connection: server,
                    info,
                },
            )
            .is_err()
        {
            self.inner.connections.remove(&server);
            return Err(Status::ConnectionRefused);
        }
        self.server = Some(server);

        if self.resumed {
            let _ = self.inner.conn_event(
                server,
                ConnectionEvent::Resumed { resumption_state },
            );
        }
        let _ = self.inner.conn_event(
            server,
            ConnectionEvent::Connected {
                negotiated_alpn: Bytes::copy_from_slice(alpn),
                is_resumed: self.resumed,
                local_addr: listener.addr,
                remote_addr: client_addr,
            },
        );
        let _ = self.inner.conn_event(
            self.client,
            ConnectionEvent::Connected {
                negotiated_alpn: Bytes::copy_from_slice(alpn),
                is_resumed: self.resumed,
                local_addr: client_addr,
                remote_addr: listener.addr,
            },
        );
        debug!(client = %self.client, %server, resumed = self.resumed, "pair established");
        Ok(())
    }

    /// Handshake never completed: cancel everything issued so far, report
    /// the failure, and keep canceling until the handles are released.
    async fn fail_connect(
        &mut self,
        status: Status,
        early: Vec<Cmd>,
        rx: mpsc::UnboundedReceiver<Cmd>,
    ) {
        debug!(client = %self.client, %status, "connect failed");
        for cmd in early {
            self.cancel_cmd(cmd);
        }
        let _ = self.inner.conn_event(
            self.client,
            ConnectionEvent::ShutdownInitiated {
                by_peer: false,
                error_code: 0,
                status,
            },
        );
        for stream in self.inner.streams_of(self.client, None) {
            self.inner.stream_event(stream, StreamEvent::ShutdownComplete);
        }
        let _ = self
            .inner
            .conn_event(self.client, ConnectionEvent::ShutdownComplete);
        self.closing = true;
        self.drain_after_teardown(rx).await;
    }

    /// Resolve a command's completion as canceled without doing its work.
    fn cancel_cmd(&self, cmd: Cmd) {
        match cmd {
            Cmd::StreamSend {
                stream, context, ..
            } => {
                self.inner.stream_event(
                    stream,
                    StreamEvent::SendComplete {
                        context,
                        canceled: true,
                    },
                );
            }
            Cmd::DatagramSend { conn, context, .. } => {
                let _ = self.inner.conn_event(
                    conn,
                    ConnectionEvent::DatagramStateChanged {
                        context,
                        state: DatagramSendState::Canceled,
                    },
                );
            }
            _ => {}
        }
    }

    /// After the pair's shutdown-complete events, no further event may be
    /// delivered for its handles. Commands that raced teardown into the
    /// channel are dropped here; the session layer's own teardown resolves
    /// their completions. The loop ends once both handles are released and
    /// the senders go away.
    async fn drain_after_teardown(&self, mut rx: mpsc::UnboundedReceiver<Cmd>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                Cmd::StreamSend { context, .. } | Cmd::DatagramSend { context, .. } => {
                    trace!(%context, "dropping command issued after teardown");
                }
                _ => {}
            }
        }
    }

    fn peer_of(&self, conn: EngineHandle) -> Option<EngineHandle> {
        if conn == self.client {
            self.server
        } else {
            Some(self.client)
        }
    }

    /// Handle one command. Returns `true` when the pair is torn down.
    fn process(&mut self, cmd: Cmd) -> bool {
        match cmd {
            Cmd::StreamStart { stream } => self.on_stream_start(stream),
            Cmd::StreamSend {
                stream,
                data,
                flags,
                context,
            } => self.on_stream_send(stream, data, flags, context),
            Cmd::StreamShutdown {
                stream,
                abortive,
                error_code,
            } => self.on_stream_shutdown(stream, abortive, error_code),
            Cmd::DatagramSend {
                conn,
                data,
                context,
            } => self.on_datagram_send(conn, data, context),
            Cmd::SendTicket { conn, payload } => self.on_send_ticket(conn, payload),
            Cmd::ConnShutdown {
                conn,
                abortive,
                error_code,
            } => {
                self.teardown(conn, abortive, error_code);
                return true;
            }
        }
        false
    }

    fn on_stream_start(&mut self, stream: EngineHandle) {
        if self.closing {
            return;
        }
        let Some(entry) = self.inner.stream(stream) else {
            return;
        };
        let id = self.inner.next_stream_id.fetch_add(4, Ordering::Relaxed);
        self.wires.entry(stream).or_default();
        self.inner.stream_event(
            stream,
            StreamEvent::StartComplete {
                status: Status::Success,
                id,
            },
        );

        // Materialize the peer-side stream and offer it.
        let Some(peer_conn) = self.peer_of(entry.conn) else {
            return;
        };
        let Some(peer_conn_entry) = self.inner.conn(peer_conn) else {
            return;
        };
        let peer_stream = EngineHandle::fresh();
        self.inner.streams.insert(
            peer_stream,
            Arc::new(StreamEntry {
                conn: peer_conn,
                sink: Arc::clone(&peer_conn_entry.sink),
                token: Mutex::new(None),
                bidirectional: entry.bidirectional,
                peer: Mutex::new(Some(stream)),
            }),
        );
        *entry.peer.lock() = Some(peer_stream);
        self.wires.entry(peer_stream).or_default();
        let _ = self.inner.conn_event(
            peer_conn,
            ConnectionEvent::IncomingStream {
                stream: peer_stream,
                bidirectional: entry.bidirectional,
            },
        );
    }

    fn on_stream_send(
        &mut self,
        stream: EngineHandle,
        data: Bytes,
        flags: SendFlags,
        context: CallbackToken,
    ) {
        let canceled = self.closing
            || self
                .wires
                .get(&stream)
                .map(|w| w.shutdown_done)
                .unwrap_or(true);
        if canceled {
            self.inner.stream_event(
                stream,
                StreamEvent::SendComplete {
                    context,
                    canceled: true,
                },
            );
            return;
        }

        let zero_rtt = self.resumed && !self.handshake_confirmed && flags.allow_zero_rtt;
        let peer = self
            .inner
            .stream(stream)
            .and_then(|entry| *entry.peer.lock());
        if let Some(peer) = peer {
            self.inner.stream_event(
                peer,
                StreamEvent::DataReceived {
                    data,
                    fin: flags.fin,
                    zero_rtt,
                },
            );
            if flags.fin {
                self.inner.stream_event(peer, StreamEvent::PeerSendShutdown);
                if let Some(wire) = self.wires.get_mut(&peer) {
                    wire.fin_received = true;
                }
            }
        }
        if flags.fin {
            if let Some(wire) = self.wires.get_mut(&stream) {
                wire.fin_sent = true;
            }
        }
        // The engine is done with the buffer once delivery happened.
        self.inner.stream_event(
            stream,
            StreamEvent::SendComplete {
                context,
                canceled: false,
            },
        );
        self.finish_if_drained(stream);
        if let Some(peer) = peer {
            self.finish_if_drained(peer);
        }
    }

    fn on_stream_shutdown(&mut self, stream: EngineHandle, abortive: bool, error_code: u64) {
        if self.closing {
            return;
        }
        let peer = self
            .inner
            .stream(stream)
            .and_then(|entry| *entry.peer.lock());
        if let Some(wire) = self.wires.get_mut(&stream) {
            wire.fin_sent = true;
            if abortive {
                wire.fin_received = true;
            }
        }
        if let Some(peer) = peer {
            if abortive {
                self.inner
                    .stream_event(peer, StreamEvent::PeerSendAborted { error_code });
            } else {
                self.inner.stream_event(peer, StreamEvent::PeerSendShutdown);
            }
            if let Some(wire) = self.wires.get_mut(&peer) {
                wire.fin_received = true;
            }
            self.finish_if_drained(peer);
        }
        self.finish_if_drained(stream);
    }

    /// Both directions done: the stream handle is finished.
    fn finish_if_drained(&mut self, stream: EngineHandle) {
        let done = match self.wires.get_mut(&stream) {
            Some(wire) if !wire.shutdown_done && wire.fin_sent && wire.fin_received => {
                wire.shutdown_done = true;
                true
            }
            _ => false,
        };
        if done {
            self.inner.stream_event(stream, StreamEvent::ShutdownComplete);
        }
    }

    fn on_datagram_send(&mut self, conn: EngineHandle, data: Bytes, context: CallbackToken) {
        if self.closing {
            let _ = self.inner.conn_event(
                conn,
                ConnectionEvent::DatagramStateChanged {
                    context,
                    state: DatagramSendState::Canceled,
                },
            );
            return;
        }
        let zero_rtt = self.resumed && !self.handshake_confirmed;
        let _ = self.inner.conn_event(
            conn,
            ConnectionEvent::DatagramStateChanged {
                context,
                state: DatagramSendState::Sent,
            },
        );
        if let Some(peer) = self.peer_of(conn) {
            let _ = self.inner.conn_event(
                peer,
                ConnectionEvent::DatagramReceived {
                    payload: data,
                    zero_rtt,
                },
            );
        }
        let _ = self.inner.conn_event(
            conn,
            ConnectionEvent::DatagramStateChanged {
                context,
                state: DatagramSendState::Acknowledged,
            },
        );
    }

    fn on_send_ticket(&mut self, conn: EngineHandle, payload: Bytes) {
        if self.closing || Some(conn) != self.server {
            return;
        }
        // Tickets are random bytes; the table maps them back to the issuing
        // endpoint so a later handshake can resume.
        let mut ticket = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut ticket);
        self.inner.tickets.insert(
            ticket.clone(),
            TicketEntry {
                port: self.port,
                alpn: self.alpn.clone(),
                payload: payload.to_vec(),
            },
        );
        let _ = self.inner.conn_event(
            self.client,
            ConnectionEvent::ResumptionTicketReceived {
                ticket: Bytes::from(ticket),
            },
        );
    }

    /// Tear the pair down: stream handles finish first, each connection's
    /// shutdown-complete comes last for that connection.
    fn teardown(&mut self, initiator: EngineHandle, abortive: bool, error_code: u64) {
        if self.closing {
            return;
        }
        self.closing = true;
        let status = if abortive {
            Status::Aborted
        } else {
            Status::Success
        };
        let peer = self.peer_of(initiator);
        debug!(%initiator, abortive, "pair teardown");

        let _ = self.inner.conn_event(
            initiator,
            ConnectionEvent::ShutdownInitiated {
                by_peer: false,
                error_code,
                status,
            },
        );
        if let Some(peer) = peer {
            let _ = self.inner.conn_event(
                peer,
                ConnectionEvent::ShutdownInitiated {
                    by_peer: true,
                    error_code,
                    status,
                },
            );
        }

        let (client, server) = (self.client, self.server);
        for stream in self.inner.streams_of(client, server) {
            let already = self
                .wires
                .get(&stream)
                .map(|w| w.shutdown_done)
                .unwrap_or(false);
            if !already {
                self.inner.stream_event(stream, StreamEvent::ShutdownComplete);
            }
        }

        if let Some(server) = server {
            let _ = self
                .inner
                .conn_event(server, ConnectionEvent::ShutdownComplete);
        }
        let _ = self
            .inner
            .conn_event(client, ConnectionEvent::ShutdownComplete);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

    struct RecordingSink {
        tx: UnboundedSender<(CallbackToken, String)>,
    }

    impl EventSink for RecordingSink {
        fn on_connection_event(
            &self,
            token: CallbackToken,
            event: ConnectionEvent,
        ) -> Result<(), Status> {
            let label = match event {
                ConnectionEvent::Connected { .. } => "connected",
                ConnectionEvent::CertificateReceived { .. } => "certificate",
                ConnectionEvent::ShutdownInitiated { .. } => "shutdown-initiated",
                ConnectionEvent::ShutdownComplete => "shutdown-complete",
                _ => "other",
            };
            let _ = self.tx.send((token, label.to_owned()));
            Ok(())
        }

        fn on_stream_event(&self, token: CallbackToken, _event: StreamEvent) -> Result<(), Status> {
            let _ = self.tx.send((token, "stream".to_owned()));
            Ok(())
        }

        fn on_listener_event(
            &self,
            token: CallbackToken,
            _event: ListenerEvent,
        ) -> Result<(), Status> {
            let _ = self.tx.send((token, "listener".to_owned()));
            // No token attachment: the offered connection is refused.
            Err(Status::ConnectionRefused)
        }
    }

    #[tokio::test]
    async fn port_zero_allocates() {
        let engine = LoopbackEngine::new();
        let (tx, _rx) = unbounded_channel();
        let reg = engine
            .open_registration("test", Arc::new(RecordingSink { tx }))
            .unwrap();
        let listener = engine.listener_open(reg, CallbackToken::from_raw(1)).unwrap();
        let cert = CertificateView {
            der: Bytes::from_static(b"cert"),
            subject: "localhost".into(),
        };
        let bound = engine
            .listener_start(listener, b"test", "127.0.0.1:0".parse().unwrap(), cert)
            .unwrap();
        assert_ne!(bound.port(), 0);
    }

    #[tokio::test]
    async fn connect_without_listener_reports_refusal() {
        let engine = LoopbackEngine::new();
        let (tx, mut rx) = unbounded_channel();
        let reg = engine
            .open_registration("test", Arc::new(RecordingSink { tx }))
            .unwrap();
        let token = CallbackToken::from_raw(7);
        let conn = engine.connection_open(reg, token).unwrap();
        engine.connection_start(conn, b"test", "localhost", 9).unwrap();

        let (got, label) = rx.recv().await.unwrap();
        assert_eq!(got, token);
        assert_eq!(label, "shutdown-initiated");
        let (_, label) = rx.recv().await.unwrap();
        assert_eq!(label, "shutdown-complete");
    }

    #[tokio::test]
    async fn refused_offer_fails_the_client_handshake() {
        let engine = LoopbackEngine::new();
        let (tx, mut rx) = unbounded_channel();
        let sink = Arc::new(RecordingSink { tx });
        let reg = engine.open_registration("test", sink).unwrap();
        let listener = engine.listener_open(reg, CallbackToken::from_raw(1)).unwrap();
        let cert = CertificateView {
            der: Bytes::from_static(b"cert"),
            subject: "localhost".into(),
        };
        let bound = engine
            .listener_start(listener, b"test", "127.0.0.1:0".parse().unwrap(), cert)
            .unwrap();

        let conn = engine
            .connection_open(reg, CallbackToken::from_raw(2))
            .unwrap();
        engine
            .connection_start(conn, b"test", "localhost", bound.port())
            .unwrap();

        // certificate, listener offer (refused), then client failure events
        let mut labels = Vec::new();
        for _ in 0..4 {
            let (_, label) = rx.recv().await.unwrap();
            labels.push(label);
        }
        assert_eq!(
            labels,
            vec![
                "certificate",
                "listener",
                "shutdown-initiated",
                "shutdown-complete"
            ]
        );
    }
}
