//! Unreliable datagram sends and their acknowledgment state machine
//!
//! A datagram send is a single message with a tracked fate:
//!
//! ```text
//! Unknown --issue--> Sent --ack--> Acknowledged | AcknowledgedSpurious
//!                      \--loss signal--> LostSuspect --timeout--> LostDiscarded
//! any pre-terminal state --teardown--> Canceled
//! ```
//!
//! `LostSuspect` is a soft warning, not a terminal state: the
//! acknowledgment may still arrive afterwards. Every transition is driven
//! by one canonical function and observed by both the push surface
//! (state-change subscription) and the pull surface (awaitable
//! completions), so the two can never disagree.

use crate::completion::Completion;
use crate::error::{QuicBridgeError, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use quicbridge_engine::{BufferLease, DatagramSendState};
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

/// Final fate of a datagram send, as resolved by the acknowledgment
/// completion. Loss and cancellation are reported outcomes, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatagramOutcome {
    /// The peer acknowledged the datagram.
    Acknowledged,
    /// The peer acknowledged after the datagram was suspected lost. A
    /// normal success.
    AcknowledgedSpurious,
    /// The datagram was declared lost and discarded.
    Lost,
    /// The connection went away before delivery resolved.
    Canceled,
}

impl DatagramOutcome {
    /// Whether the peer is known to have received the datagram.
    pub fn is_delivered(&self) -> bool {
        matches!(
            self,
            DatagramOutcome::Acknowledged | DatagramOutcome::AcknowledgedSpurious
        )
    }
}

/// Shared state of one datagram send.
pub(crate) struct DatagramInner {
    state: Mutex<DatagramSendState>,
    lease: Mutex<Option<BufferLease>>,
    sent: Completion<std::result::Result<(), QuicBridgeError>>,
    acknowledged: Completion<DatagramOutcome>,
    changes: broadcast::Sender<DatagramSendState>,
}

impl DatagramInner {
    pub(crate) fn new(lease: BufferLease) -> Self {
        let (changes, _) = broadcast::channel(16);
        Self {
            state: Mutex::new(DatagramSendState::Unknown),
            lease: Mutex::new(Some(lease)),
            sent: Completion::new(),
            acknowledged: Completion::new(),
            changes,
        }
    }

    pub(crate) fn lease_view(&self) -> Option<Bytes> {
        self.lease.lock().as_ref().map(|lease| lease.view())
    }

    /// The canonical transition function. Returns `true` when this call is
    /// the one that latched a terminal state; the caller then releases the
    /// registry entry.
    pub(crate) fn transition(&self, next: DatagramSendState) -> bool {
        {
            let mut state = self.state.lock();
            if state.is_terminal() {
                // Late signal after the fate was sealed; nothing to observe.
                return false;
            }
            *state = next;
        }
        trace!(state = ?next, "datagram transition");
        let _ = self.changes.send(next);
        match next {
            DatagramSendState::Sent => {
                self.sent.complete(Ok(()));
                false
            }
            DatagramSendState::LostSuspect | DatagramSendState::Unknown => false,
            DatagramSendState::Acknowledged => {
                self.seal(DatagramOutcome::Acknowledged);
                true
            }
            DatagramSendState::AcknowledgedSpurious => {
                self.seal(DatagramOutcome::AcknowledgedSpurious);
                true
            }
            DatagramSendState::LostDiscarded => {
                self.seal(DatagramOutcome::Lost);
                true
            }
            DatagramSendState::Canceled => {
                self.sent
                    .complete(Err(QuicBridgeError::SendCanceled));
                self.acknowledged.complete(DatagramOutcome::Canceled);
                self.release_lease();
                true
            }
        }
    }

    fn seal(&self, outcome: DatagramOutcome) {
        // An acknowledgment implies the wire accepted the send.
        self.sent.complete(Ok(()));
        self.acknowledged.complete(outcome);
        self.release_lease();
    }

    fn release_lease(&self) {
        let _lease = self.lease.lock().take();
    }

    pub(crate) fn current_state(&self) -> DatagramSendState {
        *self.state.lock()
    }
}

/// A single unreliable datagram with a tracked acknowledgment fate.
///
/// Construct one over a caller-owned buffer ([`DatagramSend::pinned`]) or
/// over a private copy ([`DatagramSend::copied`]), subscribe or grab the
/// completions, then hand it to
/// [`crate::PeerConnection::send_datagram`].
pub struct DatagramSend {
    inner: Arc<DatagramInner>,
    issued: Mutex<bool>,
}

impl DatagramSend {
    /// Wrap caller-owned bytes without copying; the memory is leased to the
    /// engine until a terminal state is reached.
    pub fn pinned(payload: Bytes) -> Self {
        Self::from_lease(BufferLease::pinned(payload))
    }

    /// Copy the payload so the caller can forget it immediately.
    pub fn copied(payload: &[u8]) -> Self {
        Self::from_lease(BufferLease::owned(payload))
    }

    /// Copy the payload and zero the copy once the send resolves.
    pub fn copied_wiped(payload: &[u8]) -> Self {
        Self::from_lease(BufferLease::owned_wiped(payload))
    }

    fn from_lease(lease: BufferLease) -> Self {
        Self {
            inner: Arc::new(DatagramInner::new(lease)),
            issued: Mutex::new(false),
        }
    }

    /// Current acknowledgment state.
    pub fn state(&self) -> DatagramSendState {
        self.inner.current_state()
    }

    /// Push-style observation: every transition, in order.
    ///
    /// Subscribe before handing the datagram to the connection, or the
    /// first transitions may already have happened.
    pub fn state_changes(&self) -> broadcast::Receiver<DatagramSendState> {
        self.inner.changes.subscribe()
    }

    /// Suspend until the engine accepted the datagram onto the wire.
    /// Resolves with an error if the send was canceled first.
    pub async fn wait_sent(&self) -> Result<()> {
        self.inner.sent.wait().await
    }

    /// Suspend until a terminal state and report the outcome.
    pub async fn wait_acknowledged(&self) -> DatagramOutcome {
        self.inner.acknowledged.wait().await
    }

    pub(crate) fn inner(&self) -> Arc<DatagramInner> {
        Arc::clone(&self.inner)
    }

    /// Flip the issued flag; a datagram can be handed to a connection only
    /// once.
    pub(crate) fn mark_issued(&self) -> Result<()> {
        let mut issued = self.issued.lock();
        if *issued {
            return Err(QuicBridgeError::InvalidState {
                expected: "unsent datagram",
                actual: "already issued",
            });
        }
        *issued = true;
        Ok(())
    }
}

impl fmt::Debug for DatagramSend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatagramSend")
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn push_and_pull_observe_the_same_transitions() {
        let dg = DatagramSend::copied(b"Hello");
        let mut changes = dg.state_changes();

        assert!(!dg.inner.transition(DatagramSendState::Sent));
        assert!(dg.inner.transition(DatagramSendState::Acknowledged));

        assert_eq!(changes.recv().await.unwrap(), DatagramSendState::Sent);
        assert_eq!(changes.recv().await.unwrap(), DatagramSendState::Acknowledged);
        dg.wait_sent().await.unwrap();
        assert_eq!(dg.wait_acknowledged().await, DatagramOutcome::Acknowledged);
    }

    #[tokio::test]
    async fn lost_suspect_is_not_terminal() {
        let dg = DatagramSend::copied(b"x");
        dg.inner.transition(DatagramSendState::Sent);
        assert!(!dg.inner.transition(DatagramSendState::LostSuspect));
        assert_eq!(dg.state(), DatagramSendState::LostSuspect);

        // The acknowledgment may still arrive after a loss suspicion.
        assert!(dg.inner.transition(DatagramSendState::AcknowledgedSpurious));
        let outcome = dg.wait_acknowledged().await;
        assert_eq!(outcome, DatagramOutcome::AcknowledgedSpurious);
        assert!(outcome.is_delivered());
    }

    #[tokio::test]
    async fn signals_after_a_terminal_state_are_ignored() {
        let dg = DatagramSend::copied(b"x");
        dg.inner.transition(DatagramSendState::Sent);
        assert!(dg.inner.transition(DatagramSendState::Acknowledged));
        assert!(!dg.inner.transition(DatagramSendState::LostSuspect));
        assert_eq!(dg.state(), DatagramSendState::Acknowledged);
    }

    #[tokio::test]
    async fn cancellation_fails_the_sent_completion() {
        let dg = DatagramSend::copied(b"x");
        assert!(dg.inner.transition(DatagramSendState::Canceled));
        assert_eq!(dg.wait_sent().await, Err(QuicBridgeError::SendCanceled));
        assert_eq!(dg.wait_acknowledged().await, DatagramOutcome::Canceled);
    }

    #[test]
    fn a_datagram_is_issued_once() {
        let dg = DatagramSend::copied(b"x");
        dg.mark_issued().unwrap();
        assert!(dg.mark_issued().is_err());
    }
}
