//! Process-scoped registration and callback dispatch
//!
//! A [`Registration`] owns the engine's registration handle and the shared
//! [`HandleRegistry`]; every listener and connection in a process hangs off
//! one. The registration's event-sink dispatcher is the single place engine
//! callbacks enter the session layer: it resolves the callback token and
//! hands the event to the owning object.

use crate::error::Result;
use crate::registry::HandleRegistry;
use quicbridge_engine::{
    CallbackToken, ConnectionEvent, EngineHandle, EventSink, ListenerEvent, Status, StreamEvent,
    TransportEngine,
};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Shared context every managed object keeps a reference to.
pub(crate) struct RegistrationInner {
    pub(crate) engine: Arc<dyn TransportEngine>,
    pub(crate) registry: Arc<HandleRegistry>,
    pub(crate) handle: EngineHandle,
    pub(crate) name: String,
}

/// Process-scoped engine context.
///
/// Created once (per process or per test scope) and dropped last; every
/// connection and listener created under it must be shut down before the
/// registration goes away.
pub struct Registration {
    inner: Arc<RegistrationInner>,
}

impl Registration {
    /// Open a registration on the given engine.
    pub fn new(engine: Arc<dyn TransportEngine>, name: &str) -> Result<Self> {
        let registry = Arc::new(HandleRegistry::new());
        let sink: Arc<dyn EventSink> = Arc::new(Dispatcher {
            registry: Arc::clone(&registry),
        });
        let handle = engine.open_registration(name, sink)?;
        debug!(name, %handle, "registration opened");
        Ok(Self {
            inner: Arc::new(RegistrationInner {
                engine,
                registry,
                handle,
                name: name.to_owned(),
            }),
        })
    }

    /// The name the registration was opened with.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of live callback-receiving objects (connections, streams,
    /// in-flight datagrams, listeners). Reaches zero once everything
    /// created under this registration has observed shutdown-complete.
    pub fn active_objects(&self) -> usize {
        self.inner.registry.len()
    }

    pub(crate) fn shared(&self) -> Arc<RegistrationInner> {
        Arc::clone(&self.inner)
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if self.inner.registry.len() > 0 {
            warn!(
                name = %self.inner.name,
                live = self.inner.registry.len(),
                "registration dropped with live objects"
            );
        }
        self.inner.engine.close_registration(self.inner.handle);
    }
}

impl fmt::Display for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[Registration {}]", self.inner.name)
    }
}

/// Routes engine callbacks through the registry to the owning object.
struct Dispatcher {
    registry: Arc<HandleRegistry>,
}

impl EventSink for Dispatcher {
    fn on_connection_event(
        &self,
        token: CallbackToken,
        event: ConnectionEvent,
    ) -> std::result::Result<(), Status> {
        let connection = self.registry.resolve_connection(token);
        crate::connection::ConnectionCore::on_event(&connection, event)
    }

    fn on_stream_event(
        &self,
        token: CallbackToken,
        event: StreamEvent,
    ) -> std::result::Result<(), Status> {
        let stream = self.registry.resolve_stream(token);
        stream.on_event(event);
        Ok(())
    }

    fn on_listener_event(
        &self,
        token: CallbackToken,
        event: ListenerEvent,
    ) -> std::result::Result<(), Status> {
        // A listener closing races inbound offers; a missing entry refuses
        // the connection instead of being treated as a lifecycle bug.
        match self.registry.try_resolve_listener(token) {
            Some(listener) => listener.on_event(event),
            None => Err(Status::ConnectionRefused),
        }
    }
}
