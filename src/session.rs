//! Session handles and the per-connection state machine.
//!
//! A [`Session`] is a cheap, cloneable handle to one live connection. The
//! socket and read buffer belong to the owning I/O worker; the handle
//! shares the outbound queue and lifecycle state with it.
//!
//! ## States
//!
//! ```text
//! Enabled ──close(false), output pending──> Closing ──drained──> Closed
//!    └────────────close(true) / idle / error──────────────────────┘
//! ```
//!
//! Transitions never go backward. `SessionClosed` is fired by the worker
//! when it tears the connection down, exactly once.

use crate::error::SessionError;
use crate::handler::{panic_message, EventKind, MessageHandler};
use crate::protocol::Message;
use crate::runtime::{Chunk, Command, OutboundQueue, Shared, WorkerHandle};
use bytes::BytesMut;
use std::error::Error as StdError;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, trace};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    /// Reading and writing.
    Enabled = 0,
    /// Draining queued output; new writes are rejected.
    Closing = 1,
    /// Terminal.
    Closed = 2,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Enabled,
            1 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

/// What the worker should write next.
pub(crate) enum Batch {
    Write(Chunk),
    /// Queue empty, gate released.
    Idle,
    /// Queue empty and the session is closing: tear it down.
    Drained,
}

/// Handle to one connection.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

struct Inner {
    id: u64,
    /// Slab key on the owning worker.
    key: usize,
    state: AtomicU8,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    outbound: Mutex<OutboundQueue>,
    worker: WorkerHandle,
    shared: Arc<Shared>,
}

impl Session {
    pub(crate) fn new(
        id: u64,
        key: usize,
        local_addr: Option<SocketAddr>,
        peer_addr: Option<SocketAddr>,
        worker: WorkerHandle,
        shared: Arc<Shared>,
    ) -> Self {
        let config = &shared.config;
        let outbound = OutboundQueue::new(
            config.write_queue_capacity,
            config.high_watermark,
            config.low_watermark,
            config.coalesce_threshold,
        );
        Self {
            inner: Arc::new(Inner {
                id,
                key,
                state: AtomicU8::new(SessionState::Enabled as u8),
                local_addr,
                peer_addr,
                outbound: Mutex::new(outbound),
                worker,
                shared,
            }),
        }
    }

    /// Unique id within the owning server or client.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// True while the session accepts writes.
    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Enabled
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr
    }

    /// Encode `message` and queue it for sending.
    pub fn send(&self, message: &Message) -> Result<(), SessionError> {
        self.check_writable()?;
        let mut encoded = BytesMut::new();
        self.inner.shared.codec.encode(message, &mut encoded)?;
        trace!(session = self.id(), len = encoded.len(), "Queueing message");
        self.write_raw(&encoded)
    }

    /// Queue already-encoded bytes for sending, bypassing the codec.
    pub fn write_raw(&self, bytes: &[u8]) -> Result<(), SessionError> {
        self.check_writable()?;
        if bytes.is_empty() {
            return Ok(());
        }
        let mut chunk = self
            .inner
            .shared
            .arena
            .allocate_near(self.inner.worker.index(), bytes.len());
        chunk.copy_from_slice(bytes);
        self.offer(chunk)
    }

    /// Close the session.
    ///
    /// With `immediate`, pending output is discarded and the socket closed.
    /// Otherwise the session drains its queue first; with nothing pending
    /// this is the same as an immediate close. Calling `close` on a closed
    /// session does nothing.
    pub fn close(&self, immediate: bool) {
        if immediate || self.begin_graceful_close() {
            self.close_now();
        }
    }

    /// Queued and in-flight bytes as a fraction of the write queue capacity.
    pub fn write_queue_occupancy(&self) -> f64 {
        self.outbound().occupancy()
    }

    /// True while reads are suspended by write backpressure.
    pub fn is_flow_limited(&self) -> bool {
        self.outbound().is_flow_limited()
    }

    fn check_writable(&self) -> Result<(), SessionError> {
        match self.state() {
            SessionState::Enabled => Ok(()),
            SessionState::Closing => Err(SessionError::Closing(self.id())),
            SessionState::Closed => Err(SessionError::Closed(self.id())),
        }
    }

    fn outbound(&self) -> MutexGuard<'_, OutboundQueue> {
        self.inner
            .outbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn offer(&self, chunk: Chunk) -> Result<(), SessionError> {
        let offer = {
            let mut queue = self.outbound();
            // Checked under the queue lock so a concurrent graceful close
            // sees either this chunk or the rejection.
            self.check_writable()?;
            queue.offer(chunk)
        };

        if offer.flow_limited {
            debug!(session = self.id(), "Write queue above high watermark, suspending reads");
            self.fire(EventKind::FlowLimit, None);
        }
        if offer.start_write {
            self.inner.worker.send(Command::Flush {
                key: self.inner.key,
                id: self.inner.id,
            })?;
        }
        Ok(())
    }

    /// Start a graceful close. Returns `true` if the caller must close now.
    pub(crate) fn begin_graceful_close(&self) -> bool {
        {
            let queue = self.outbound();
            match self.state() {
                SessionState::Enabled if queue.is_idle() => return true,
                SessionState::Enabled => {
                    self.inner
                        .state
                        .store(SessionState::Closing as u8, Ordering::Release);
                }
                SessionState::Closing => return false,
                SessionState::Closed => {
                    debug!(session = self.id(), "Close on closed session ignored");
                    return false;
                }
            }
        }
        debug!(session = self.id(), "Session closing, draining output");
        self.fire(EventKind::SessionClosing, None);
        false
    }

    fn close_now(&self) {
        let prev = {
            let mut queue = self.outbound();
            let prev = self
                .inner
                .state
                .swap(SessionState::Closed as u8, Ordering::AcqRel);
            // Discarded output must not reach a flush still in progress
            queue.clear();
            prev
        };
        if SessionState::from_u8(prev) == SessionState::Closed {
            debug!(session = self.id(), "Close on closed session ignored");
            return;
        }
        // A stopped worker has already torn every connection down
        let _ = self.inner.worker.send(Command::Close {
            key: self.inner.key,
            id: self.inner.id,
        });
    }

    /// Move to `Closed` and drop queued output. Returns the previous state.
    pub(crate) fn mark_closed(&self) -> SessionState {
        let mut queue = self.outbound();
        let prev = self
            .inner
            .state
            .swap(SessionState::Closed as u8, Ordering::AcqRel);
        queue.clear();
        SessionState::from_u8(prev)
    }

    pub(crate) fn next_batch(&self) -> Batch {
        let mut queue = self.outbound();
        match queue.next_batch(&self.inner.shared.arena, self.inner.worker.index()) {
            Some(chunk) => Batch::Write(chunk),
            None if self.state() == SessionState::Closing => Batch::Drained,
            None => Batch::Idle,
        }
    }

    /// Account for a finished write. Returns `true` if reads may resume.
    pub(crate) fn complete_write(&self, len: usize) -> bool {
        self.outbound().complete(len)
    }

    /// Index of the owning worker.
    pub(crate) fn worker_index(&self) -> usize {
        self.inner.worker.index()
    }

    pub(crate) fn handler(&self) -> &dyn MessageHandler {
        &*self.inner.shared.handler
    }

    /// Deliver an event to the handler, containing panics.
    pub(crate) fn fire(&self, kind: EventKind, cause: Option<&(dyn StdError + 'static)>) {
        let handler = self.handler();
        if let Err(payload) =
            panic::catch_unwind(AssertUnwindSafe(|| handler.on_event(self, kind, cause)))
        {
            error!(
                session = self.id(),
                event = ?kind,
                panic = %panic_message(payload.as_ref()),
                "Event handler panicked"
            );
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("peer", &self.inner.peer_addr)
            .finish()
    }
}
