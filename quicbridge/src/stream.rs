//! Ordered byte streams with buffer-ownership-aware sends
//!
//! A stream's send and receive directions have independent lifecycles. On
//! the send side every `send` leases its buffer to the engine and returns a
//! [`PendingSend`] that resolves exactly once, when the engine reports the
//! matching send-complete (matched by descriptor identity, never by
//! position). On the receive side the engine's transient data views are
//! copied into the stream's buffer inside the callback (the view dies when
//! the callback returns), and consumers drain with [`Stream::receive`]
//! after waiting on [`Stream::readable`].

use crate::completion::Completion;
use crate::connection::ConnectionCore;
use crate::error::{QuicBridgeError, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use quicbridge_engine::{BufferLease, CallbackToken, EngineHandle, SendFlags, StreamEvent};
use std::collections::VecDeque;
use std::fmt;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, trace, warn};

/// Stream-level notifications republished to subscribers.
#[derive(Debug, Clone)]
pub enum StreamNotification {
    /// The stream acquired its wire identity.
    Started {
        /// Wire-level stream id.
        id: u64,
    },
    /// Ordered bytes were buffered and can be drained.
    DataReceived {
        /// Number of bytes in this delivery.
        len: usize,
        /// Whether this delivery closed the peer's send direction.
        fin: bool,
        /// Whether the bytes arrived before handshake confirmation.
        zero_rtt: bool,
    },
    /// The peer gracefully closed its send direction.
    PeerSendShutdown,
    /// The peer abortively closed its send direction.
    PeerSendAborted {
        /// Application error code carried by the abort.
        error_code: u64,
    },
    /// The engine confirmed this stream is fully shut down.
    ShutdownComplete,
}

/// Context of one in-flight send: the leased buffer and the completion that
/// resolves when the engine is done with it.
pub(crate) struct SendContext {
    lease: Mutex<Option<BufferLease>>,
    completion: Completion<std::result::Result<(), QuicBridgeError>>,
}

impl SendContext {
    fn new(lease: BufferLease) -> Self {
        Self {
            lease: Mutex::new(Some(lease)),
            completion: Completion::new(),
        }
    }

    /// Release the lease and latch the completion. The lease must not be
    /// released before the engine reported completion for this descriptor;
    /// this is the single place that does it.
    fn resolve(&self, canceled: bool) {
        let _lease = self.lease.lock().take();
        self.completion.complete(if canceled {
            Err(QuicBridgeError::SendCanceled)
        } else {
            Ok(())
        });
    }
}

/// Awaitable handle for one send. Resolves exactly once: success after the
/// engine's send-complete for this buffer, or [`QuicBridgeError::SendCanceled`]
/// if teardown got there first.
pub struct PendingSend {
    context: Arc<SendContext>,
}

impl PendingSend {
    /// Suspend until the send resolves.
    pub async fn wait(&self) -> Result<()> {
        self.context.completion.wait().await
    }

    /// Whether the send already resolved.
    pub fn is_resolved(&self) -> bool {
        self.context.completion.is_complete()
    }
}

impl std::fmt::Debug for PendingSend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingSend")
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

struct SendSide {
    /// False once a FIN was sent or shutdown requested; no further sends.
    open: bool,
    /// Outstanding sends in issue order, matched to completions by token.
    pending: VecDeque<(CallbackToken, Arc<SendContext>)>,
}

struct RecvSide {
    /// Buffered deliveries not yet drained, with their 0-RTT tag.
    segments: VecDeque<(Bytes, bool)>,
    /// Peer send direction closed; no more data will arrive.
    fin: bool,
    /// Some delivery on this stream arrived before handshake confirmation.
    zero_rtt_seen: bool,
}

/// Shared stream state; the public [`Stream`] wraps it.
pub(crate) struct StreamCore {
    conn: Arc<ConnectionCore>,
    handle: Mutex<Option<EngineHandle>>,
    token: Mutex<Option<CallbackToken>>,
    bidirectional: bool,
    started: AtomicBool,
    id: Mutex<Option<u64>>,
    send: Mutex<SendSide>,
    recv: Mutex<RecvSide>,
    readable: Notify,
    notifications: broadcast::Sender<StreamNotification>,
    finished: Completion<()>,
    finalized: AtomicBool,
}

impl StreamCore {
    pub(crate) fn new(conn: Arc<ConnectionCore>, bidirectional: bool) -> Self {
        let (notifications, _) = broadcast::channel(64);
        Self {
            conn,
            handle: Mutex::new(None),
            token: Mutex::new(None),
            bidirectional,
            started: AtomicBool::new(false),
            id: Mutex::new(None),
            send: Mutex::new(SendSide {
                open: true,
                pending: VecDeque::new(),
            }),
            recv: Mutex::new(RecvSide {
                segments: VecDeque::new(),
                fin: false,
                zero_rtt_seen: false,
            }),
            readable: Notify::new(),
            notifications,
            finished: Completion::new(),
            finalized: AtomicBool::new(false),
        }
    }

    /// Core for a peer-opened stream: the engine already started it.
    pub(crate) fn incoming(
        conn: Arc<ConnectionCore>,
        handle: EngineHandle,
        bidirectional: bool,
    ) -> Self {
        let core = Self::new(conn, bidirectional);
        *core.handle.lock() = Some(handle);
        core.started.store(true, Ordering::SeqCst);
        core
    }

    pub(crate) fn set_handle(&self, handle: EngineHandle) {
        *self.handle.lock() = Some(handle);
    }

    pub(crate) fn set_token(&self, token: CallbackToken) {
        *self.token.lock() = Some(token);
    }

    fn engine_handle(&self) -> Result<EngineHandle> {
        (*self.handle.lock()).ok_or(QuicBridgeError::StreamClosed)
    }

    fn send_lease(&self, lease: BufferLease, mut flags: SendFlags) -> Result<PendingSend> {
        if self.conn.is_terminating() {
            return Err(QuicBridgeError::ConnectionClosed);
        }
        let handle = self.engine_handle()?;
        if self.conn.allow_zero_rtt() {
            flags.allow_zero_rtt = true;
        }

        let view = lease.view();
        let context = Arc::new(SendContext::new(lease));
        let token = self.conn.shared().registry.allocate_token();
        {
            let mut send = self.send.lock();
            if !send.open {
                return Err(QuicBridgeError::StreamClosed);
            }
            if flags.fin {
                send.open = false;
            }
            // Queued before the engine call so a racing completion always
            // finds its context.
            send.pending.push_back((token, Arc::clone(&context)));
        }

        if let Err(err) = self
            .conn
            .shared()
            .engine
            .stream_send(handle, view, flags, token)
        {
            let mut send = self.send.lock();
            send.pending.retain(|(t, _)| *t != token);
            if flags.fin {
                send.open = true;
            }
            return Err(err.into());
        }
        // Teardown may have drained the pending queue between the state
        // check and the push; resolve the straggler as canceled.
        if self.finalized.load(Ordering::SeqCst) {
            let straggler = {
                let mut send = self.send.lock();
                let position = send.pending.iter().position(|(t, _)| *t == token);
                position.and_then(|i| send.pending.remove(i))
            };
            if let Some((_, ctx)) = straggler {
                ctx.resolve(true);
            }
        }
        trace!(%token, fin = flags.fin, "send queued");
        Ok(PendingSend { context })
    }

    pub(crate) fn on_event(&self, event: StreamEvent) {
        match event {
            StreamEvent::StartComplete { status, id } => {
                if status.is_ok() {
                    self.started.store(true, Ordering::SeqCst);
                    *self.id.lock() = Some(id);
                    let _ = self
                        .notifications
                        .send(StreamNotification::Started { id });
                } else {
                    warn!(%status, "stream start failed");
                }
            }
            StreamEvent::DataReceived {
                data,
                fin,
                zero_rtt,
            } => {
                // The engine's view is invalidated when this callback
                // returns; everything retained is copied out here.
                let copied = Bytes::copy_from_slice(&data);
                let len = copied.len();
                {
                    let mut recv = self.recv.lock();
                    if !copied.is_empty() {
                        recv.segments.push_back((copied, zero_rtt));
                    }
                    if zero_rtt {
                        recv.zero_rtt_seen = true;
                    }
                    if fin {
                        recv.fin = true;
                    }
                }
                self.readable.notify_waiters();
                let _ = self.notifications.send(StreamNotification::DataReceived {
                    len,
                    fin,
                    zero_rtt,
                });
            }
            StreamEvent::SendComplete { context, canceled } => {
                let found = {
                    let mut send = self.send.lock();
                    let position = send.pending.iter().position(|(t, _)| *t == context);
                    position.and_then(|i| send.pending.remove(i))
                };
                match found {
                    Some((_, ctx)) => ctx.resolve(canceled),
                    // A completion for a descriptor this stream never
                    // issued is an ownership violation, not a glitch.
                    None => panic!("send completion for unknown descriptor {context}"),
                }
            }
            StreamEvent::PeerSendShutdown => {
                self.recv.lock().fin = true;
                self.readable.notify_waiters();
                let _ = self
                    .notifications
                    .send(StreamNotification::PeerSendShutdown);
            }
            StreamEvent::PeerSendAborted { error_code } => {
                self.recv.lock().fin = true;
                self.readable.notify_waiters();
                let _ = self
                    .notifications
                    .send(StreamNotification::PeerSendAborted { error_code });
            }
            StreamEvent::ShutdownComplete => self.finalize(),
        }
    }

    /// Terminal cleanup. Idempotent: reached from the engine's
    /// shutdown-complete for this stream, or synthesized by the owning
    /// connection's teardown, whichever comes first.
    pub(crate) fn finalize(&self) {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return;
        }
        let leftovers: Vec<_> = {
            let mut send = self.send.lock();
            send.open = false;
            send.pending.drain(..).collect()
        };
        for (token, context) in leftovers {
            trace!(%token, "resolving send as canceled at stream teardown");
            context.resolve(true);
        }
        self.recv.lock().fin = true;
        self.readable.notify_waiters();
        let _ = self
            .notifications
            .send(StreamNotification::ShutdownComplete);
        self.finished.complete(());

        let shared = self.conn.shared();
        if let Some(handle) = *self.handle.lock() {
            shared.engine.stream_close(handle);
        }
        // Releasing the registry entry is the last action on this stream's
        // native identity.
        if let Some(token) = self.token.lock().take() {
            shared.registry.unregister(token);
        }
        debug!("stream finalized");
    }

    fn request_shutdown(&self, abortive: bool, error_code: u64) -> Result<()> {
        if self.finalized.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.send.lock().open = false;
        let handle = self.engine_handle()?;
        self.conn
            .shared()
            .engine
            .stream_shutdown(handle, abortive, error_code)?;
        Ok(())
    }
}

/// An ordered byte channel on a connection, with independent send and
/// receive lifecycles.
pub struct Stream {
    core: Arc<StreamCore>,
}

impl Stream {
    pub(crate) fn from_core(core: Arc<StreamCore>) -> Self {
        Self { core }
    }

    /// Queue caller-owned bytes for transmission without copying. The
    /// buffer is leased to the engine until the returned [`PendingSend`]
    /// resolves.
    pub fn send(&self, data: Bytes, flags: SendFlags) -> Result<PendingSend> {
        self.core.send_lease(BufferLease::pinned(data), flags)
    }

    /// Copy the payload into an engine-managed allocation and queue it;
    /// fire-and-forget callers need not keep the source alive.
    pub fn send_copied(&self, payload: &[u8], flags: SendFlags) -> Result<PendingSend> {
        self.core.send_lease(BufferLease::owned(payload), flags)
    }

    /// Drain buffered received bytes into `dest`, returning how many were
    /// copied. Non-blocking; combine with [`Stream::readable`].
    pub fn receive(&self, dest: &mut [u8]) -> usize {
        let mut recv = self.core.recv.lock();
        let mut copied = 0;
        while copied < dest.len() {
            let Some((segment, zero_rtt)) = recv.segments.pop_front() else {
                break;
            };
            let take = (dest.len() - copied).min(segment.len());
            dest[copied..copied + take].copy_from_slice(&segment[..take]);
            copied += take;
            if take < segment.len() {
                recv.segments.push_front((segment.slice(take..), zero_rtt));
            }
        }
        copied
    }

    /// Suspend until data is buffered or the peer's send direction closed.
    pub async fn readable(&self) {
        loop {
            let mut notified = pin!(self.core.readable.notified());
            notified.as_mut().enable();
            {
                let recv = self.core.recv.lock();
                if !recv.segments.is_empty() || recv.fin {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Whether the stream acquired its wire identity.
    pub fn started(&self) -> bool {
        self.core.started.load(Ordering::SeqCst)
    }

    /// Wire-level stream id, once started.
    pub fn id(&self) -> Option<u64> {
        *self.core.id.lock()
    }

    /// Whether the stream was opened bidirectional.
    pub fn bidirectional(&self) -> bool {
        self.core.bidirectional
    }

    /// Whether the peer's send direction is closed and the buffer drained.
    pub fn is_finished_receiving(&self) -> bool {
        let recv = self.core.recv.lock();
        recv.fin && recv.segments.is_empty()
    }

    /// Whether any delivery on this stream arrived before handshake
    /// confirmation (0-RTT). Replay-sensitive consumers check this before
    /// acting on early data.
    pub fn zero_rtt_received(&self) -> bool {
        self.core.recv.lock().zero_rtt_seen
    }

    /// Request shutdown. Graceful shutdown flushes queued sends before the
    /// engine confirms; abortive shutdown cancels them.
    pub fn shutdown(&self, abortive: bool, error_code: u64) -> Result<()> {
        self.core.request_shutdown(abortive, error_code)
    }

    /// Suspend until the engine confirmed full shutdown of this stream.
    pub async fn finished(&self) {
        self.core.finished.wait().await
    }

    /// Subscribe to stream notifications.
    pub fn notifications(&self) -> broadcast::Receiver<StreamNotification> {
        self.core.notifications.subscribe()
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        // Best-effort graceful shutdown; completion arrives via callbacks.
        let _ = self.core.request_shutdown(false, 0);
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id())
            .field("started", &self.started())
            .finish()
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id() {
            Some(id) => write!(f, "[Stream {id}]"),
            None => write!(f, "[Stream unstarted]"),
        }
    }
}
