//! Accepting inbound connections
//!
//! A listener binds a local address and, for every connection the engine
//! offers, constructs a [`ServerConnection`] around the offered handle,
//! registers it, and queues it for [`Listener::accept`]. Offers that arrive
//! while nothing can claim them are refused back to the engine.

use crate::config::ServerConfig;
use crate::connection::{ConnectionCore, ServerConnection};
use crate::error::{QuicBridgeError, Result};
use crate::registration::{Registration, RegistrationInner};
use crate::registry::RegistryEntry;
use parking_lot::Mutex;
use quicbridge_engine::{CallbackToken, EngineHandle, ListenerEvent, Status};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

/// Listener notifications republished to subscribers. The accepted
/// connection itself travels through [`Listener::accept`].
#[derive(Debug, Clone)]
pub enum ListenerNotification {
    /// A client connected and was queued for accept.
    ClientConnected {
        /// Remote address of the new connection.
        remote_addr: SocketAddr,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListenerState {
    Idle,
    Started,
    Stopped,
}

pub(crate) struct ListenerCore {
    shared: Arc<RegistrationInner>,
    config: ServerConfig,
    handle: Mutex<Option<EngineHandle>>,
    token: Mutex<Option<CallbackToken>>,
    state: Mutex<ListenerState>,
    local_addr: Mutex<Option<SocketAddr>>,
    accept_tx: mpsc::UnboundedSender<ServerConnection>,
    accept_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ServerConnection>>,
    notifications: broadcast::Sender<ListenerNotification>,
}

impl ListenerCore {
    /// Offer handling: build and register the server connection, attach its
    /// callback token, then publish it. Runs on the engine's callback task;
    /// an error return makes the engine refuse the connection.
    pub(crate) fn on_event(&self, event: ListenerEvent) -> std::result::Result<(), Status> {
        let ListenerEvent::NewConnection { connection, info } = event;
        if *self.state.lock() != ListenerState::Started {
            return Err(Status::ConnectionRefused);
        }

        let core = Arc::new(ConnectionCore::server(
            Arc::clone(&self.shared),
            &self.config,
            connection,
            &info,
        ));
        let token = self
            .shared
            .registry
            .register(RegistryEntry::Connection(Arc::clone(&core)));
        core.set_token(token);
        // From here the engine routes the connection's events to the new
        // object; this must precede returning from the offer.
        self.shared
            .engine
            .connection_set_callback_token(connection, token);

        info!(remote = %info.remote_addr, alpn = ?info.negotiated_alpn, "client connected");
        let _ = self.notifications.send(ListenerNotification::ClientConnected {
            remote_addr: info.remote_addr,
        });
        self.accept_tx
            .send(ServerConnection::from_core(core))
            .map_err(|_| Status::ConnectionRefused)
    }
}

/// Accepts inbound connections and binds them to server configuration.
pub struct Listener {
    core: Arc<ListenerCore>,
}

impl Listener {
    /// Create a listener under a registration. It does not accept until
    /// [`Listener::start`].
    pub fn new(registration: &Registration, config: ServerConfig) -> Result<Self> {
        let shared = registration.shared();
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let (notifications, _) = broadcast::channel(64);
        let core = Arc::new(ListenerCore {
            shared: Arc::clone(&shared),
            config,
            handle: Mutex::new(None),
            token: Mutex::new(None),
            state: Mutex::new(ListenerState::Idle),
            local_addr: Mutex::new(None),
            accept_tx,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            notifications,
        });
        let token = shared
            .registry
            .register(RegistryEntry::Listener(Arc::clone(&core)));
        *core.token.lock() = Some(token);

        let handle = match shared.engine.listener_open(shared.handle, token) {
            Ok(handle) => handle,
            Err(err) => {
                core.token.lock().take();
                shared.registry.unregister(token);
                return Err(err.into());
            }
        };
        *core.handle.lock() = Some(handle);
        Ok(Self { core })
    }

    /// Bind and start accepting. Returns the bound address (use port 0 to
    /// let the engine allocate one).
    pub fn start(&self, addr: SocketAddr) -> Result<SocketAddr> {
        {
            let mut state = self.core.state.lock();
            if *state != ListenerState::Idle {
                return Err(QuicBridgeError::InvalidState {
                    expected: "idle listener",
                    actual: "already started or stopped",
                });
            }
            *state = ListenerState::Started;
        }
        let handle = (*self.core.handle.lock()).ok_or(QuicBridgeError::ListenerClosed)?;
        let bound = match self.core.shared.engine.listener_start(
            handle,
            &self.core.config.alpn,
            addr,
            self.core.config.credentials.certificate.clone(),
        ) {
            Ok(bound) => bound,
            Err(err) => {
                *self.core.state.lock() = ListenerState::Idle;
                return Err(err.into());
            }
        };
        *self.core.local_addr.lock() = Some(bound);
        info!(%bound, "listener started");
        Ok(bound)
    }

    /// Receive the next accepted connection.
    pub async fn accept(&self) -> Result<ServerConnection> {
        self.core
            .accept_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(QuicBridgeError::ListenerClosed)
    }

    /// Stop accepting. Connections already accepted are unaffected.
    pub fn stop(&self) {
        let was_started = {
            let mut state = self.core.state.lock();
            let was = *state == ListenerState::Started;
            *state = ListenerState::Stopped;
            was
        };
        if was_started {
            if let Some(handle) = *self.core.handle.lock() {
                self.core.shared.engine.listener_stop(handle);
                debug!("listener stopped");
            }
        }
    }

    /// The bound address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.core.local_addr.lock()
    }

    /// Subscribe to listener notifications.
    pub fn notifications(&self) -> broadcast::Receiver<ListenerNotification> {
        self.core.notifications.subscribe()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = self.core.handle.lock().take() {
            self.core.shared.engine.listener_close(handle);
        }
        // Listeners have no engine-confirmed shutdown; the entry goes when
        // the handle does, and racing offers resolve as refused.
        if let Some(token) = self.core.token.lock().take() {
            self.core.shared.registry.unregister(token);
        }
    }
}

impl fmt::Display for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.local_addr() {
            Some(addr) => write!(f, "[Listener {addr}]"),
            None => write!(f, "[Listener unbound]"),
        }
    }
}
