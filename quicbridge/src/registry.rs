//! Handle registry: routing engine callbacks to managed objects
//!
//! Every managed object that can receive engine callbacks holds exactly one
//! registry entry, keyed by a generation-counted token that is never
//! reused. Registration happens strictly after the object is fully
//! constructed; unregistration happens strictly after the object has
//! processed its shutdown-complete event, so a resolved entry is never
//! partially built or already torn down.
//!
//! Failing to resolve a token is not a recoverable condition: it means a
//! callback outlived its object's lifetime, which is a bug in the lifecycle
//! machinery, and it panics.

use crate::connection::ConnectionCore;
use crate::datagram::DatagramInner;
use crate::listener::ListenerCore;
use crate::stream::StreamCore;
use dashmap::DashMap;
use quicbridge_engine::CallbackToken;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// One live callback-receiving object.
pub(crate) enum RegistryEntry {
    /// A peer connection (client or server role).
    Connection(Arc<ConnectionCore>),
    /// A stream.
    Stream(Arc<StreamCore>),
    /// An in-flight datagram send.
    Datagram(Arc<DatagramInner>),
    /// A listener.
    Listener(Arc<ListenerCore>),
}

impl RegistryEntry {
    fn kind(&self) -> &'static str {
        match self {
            RegistryEntry::Connection(_) => "connection",
            RegistryEntry::Stream(_) => "stream",
            RegistryEntry::Datagram(_) => "datagram",
            RegistryEntry::Listener(_) => "listener",
        }
    }
}

/// Concurrent token-to-object map shared by every callback dispatch.
pub(crate) struct HandleRegistry {
    entries: DashMap<u64, RegistryEntry>,
    next_token: AtomicU64,
}

impl HandleRegistry {
    pub(crate) fn new() -> Self {
        Self {
            entries: DashMap::new(),
            next_token: AtomicU64::new(1),
        }
    }

    /// Insert a fully constructed object and mint its token.
    pub(crate) fn register(&self, entry: RegistryEntry) -> CallbackToken {
        let token = self.allocate_token();
        self.entries.insert(token.raw(), entry);
        token
    }

    /// Mint a token without an entry. Used as the identity of per-send
    /// contexts, which are matched inside their stream's pending queue
    /// rather than resolved through the registry.
    pub(crate) fn allocate_token(&self) -> CallbackToken {
        CallbackToken::from_raw(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    /// Remove an entry once its object observed shutdown-complete.
    ///
    /// Panics if the token is not registered: removing an entry twice means
    /// two finalization paths ran for one object.
    pub(crate) fn unregister(&self, token: CallbackToken) {
        if self.entries.remove(&token.raw()).is_none() {
            panic!("registry token {token} unregistered twice");
        }
    }

    /// Number of live entries.
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn resolve_connection(&self, token: CallbackToken) -> Arc<ConnectionCore> {
        match self.resolve(token) {
            RegistryEntry::Connection(core) => core,
            other => panic!("token {token} resolved to a {}, expected a connection", other.kind()),
        }
    }

    pub(crate) fn resolve_stream(&self, token: CallbackToken) -> Arc<StreamCore> {
        match self.resolve(token) {
            RegistryEntry::Stream(core) => core,
            other => panic!("token {token} resolved to a {}, expected a stream", other.kind()),
        }
    }

    pub(crate) fn resolve_datagram(&self, token: CallbackToken) -> Arc<DatagramInner> {
        match self.resolve(token) {
            RegistryEntry::Datagram(inner) => inner,
            other => panic!("token {token} resolved to a {}, expected a datagram", other.kind()),
        }
    }

    /// Listener resolution is the one lookup allowed to miss: a listener's
    /// entry is removed on close without an engine-confirmed quiesce, so an
    /// offer racing the close resolves to `None` and is refused.
    pub(crate) fn try_resolve_listener(&self, token: CallbackToken) -> Option<Arc<ListenerCore>> {
        match self.entries.get(&token.raw()) {
            Some(entry) => match &*entry {
                RegistryEntry::Listener(core) => Some(Arc::clone(core)),
                other => panic!("token {token} resolved to a {}, expected a listener", other.kind()),
            },
            None => None,
        }
    }

    fn resolve(&self, token: CallbackToken) -> RegistryEntry {
        let entry = self
            .entries
            .get(&token.raw())
            .unwrap_or_else(|| panic!("callback for unknown registry token {token}"));
        match &*entry {
            RegistryEntry::Connection(core) => RegistryEntry::Connection(Arc::clone(core)),
            RegistryEntry::Stream(core) => RegistryEntry::Stream(Arc::clone(core)),
            RegistryEntry::Datagram(inner) => RegistryEntry::Datagram(Arc::clone(inner)),
            RegistryEntry::Listener(core) => RegistryEntry::Listener(Arc::clone(core)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datagram::DatagramInner;
    use quicbridge_engine::BufferLease;

    fn datagram_entry() -> RegistryEntry {
        RegistryEntry::Datagram(Arc::new(DatagramInner::new(BufferLease::owned(b"x"))))
    }

    #[test]
    fn tokens_are_never_reused() {
        let registry = HandleRegistry::new();
        let a = registry.register(datagram_entry());
        registry.unregister(a);
        let b = registry.register(datagram_entry());
        assert_ne!(a, b);
    }

    #[test]
    fn resolves_registered_entries() {
        let registry = HandleRegistry::new();
        let token = registry.register(datagram_entry());
        let _ = registry.resolve_datagram(token);
        assert_eq!(registry.len(), 1);
        registry.unregister(token);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    #[should_panic(expected = "unknown registry token")]
    fn resolving_a_stale_token_is_fatal() {
        let registry = HandleRegistry::new();
        let token = registry.register(datagram_entry());
        registry.unregister(token);
        let _ = registry.resolve_datagram(token);
    }

    #[test]
    #[should_panic(expected = "unregistered twice")]
    fn double_unregister_is_fatal() {
        let registry = HandleRegistry::new();
        let token = registry.register(datagram_entry());
        registry.unregister(token);
        registry.unregister(token);
    }

    #[test]
    fn missing_listener_resolves_to_none() {
        let registry = HandleRegistry::new();
        assert!(registry.try_resolve_listener(CallbackToken::from_raw(99)).is_none());
    }
}
