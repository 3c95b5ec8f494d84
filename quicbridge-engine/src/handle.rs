//! Opaque identities exchanged across the engine boundary

use std::fmt;
use uuid::Uuid;

/// Opaque identity of an engine-owned object (registration, listener,
/// connection, or stream).
///
/// Handles are minted by the engine and never interpreted by the session
/// layer; they are only passed back into entry points or used as map keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineHandle(Uuid);

impl EngineHandle {
    /// Mint a fresh handle. Only engine implementations call this.
    pub fn fresh() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to correlate log lines.
        let s = self.0.simple().to_string();
        write!(f, "{}", &s[..8])
    }
}

/// Opaque callback context the session layer attaches to a handle or to a
/// single in-flight send.
///
/// The engine echoes the token on every event for that handle (or that
/// send), and never interprets it. Tokens come from a generation counter and
/// are never reused, so a stale token can only ever miss; it cannot alias a
/// newer object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackToken(u64);

impl CallbackToken {
    /// Wrap a raw counter value as a token.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw counter value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallbackToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_are_distinct() {
        assert_ne!(EngineHandle::fresh(), EngineHandle::fresh());
    }

    #[test]
    fn token_round_trips_raw_value() {
        let token = CallbackToken::from_raw(42);
        assert_eq!(token.raw(), 42);
        assert_eq!(token.to_string(), "#42");
    }
}
