//! I/O runtime.
//!
//! A fixed group of mio workers, each owning a `Poll`, a slab of
//! connections and a command inbox. Workers are the only threads that touch
//! sockets. Other threads talk to them through [`Command`]s followed by a
//! wake of the worker's poll.
//!
//! Shared pieces:
//! - `BufferArena`: pooled chunks for read buffers and encoded output
//! - `OutboundQueue`: per-session write queue and write gate
//! - `Acceptor`: server listener plus the connection ceiling

mod buffer;
mod event_loop;
mod outbound;

pub use buffer::{ArenaStats, BufferArena, Chunk, Page, ReadBuffer};
pub use outbound::{Offer, OutboundQueue};

use crate::config::Config;
use crate::error::SessionError;
use crate::handler::{Dispatcher, MessageHandler};
use crate::policy::IdlePolicy;
use crate::protocol::Codec;
use crate::session::Session;
use crossbeam::channel::{self, Sender};
use event_loop::{Worker, WAKER_TOKEN};
use mio::net::TcpStream;
use mio::{Poll, Waker};
use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

/// State shared by every worker, session and handler thread of one
/// server or client.
pub(crate) struct Shared {
    pub(crate) config: Config,
    pub(crate) arena: BufferArena,
    pub(crate) codec: Arc<dyn Codec>,
    pub(crate) handler: Arc<dyn MessageHandler>,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) policy: IdlePolicy,
    pub(crate) next_session_id: AtomicU64,
}

impl Shared {
    pub(crate) fn new(
        config: Config,
        codec: Arc<dyn Codec>,
        handler: Arc<dyn MessageHandler>,
    ) -> io::Result<Self> {
        let arena = BufferArena::new(
            config.page_count(),
            config.page_size,
            config.max_chunk_size,
        );
        let dispatcher = Dispatcher::new(config.dispatch_threads, config.dispatch_queue_capacity)?;
        let policy = IdlePolicy::from_config(&config);
        Ok(Self {
            config,
            arena,
            codec,
            handler,
            dispatcher,
            policy,
            next_session_id: AtomicU64::new(1),
        })
    }
}

/// Instructions for a worker, delivered through its inbox.
pub(crate) enum Command {
    /// Adopt an outbound connection and reply with its session.
    Register {
        stream: TcpStream,
        reply: Sender<Result<Session, SessionError>>,
    },
    /// The session's write gate was taken; start writing.
    Flush { key: usize, id: u64 },
    /// Tear the session down now.
    Close { key: usize, id: u64 },
    Shutdown,
}

/// Sending side of one worker's inbox.
#[derive(Clone)]
pub(crate) struct WorkerHandle {
    index: usize,
    tx: Sender<Command>,
    waker: Arc<Waker>,
}

impl WorkerHandle {
    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn send(&self, command: Command) -> Result<(), SessionError> {
        self.tx
            .send(command)
            .map_err(|_| SessionError::WorkerUnavailable(self.index))?;
        self.waker.wake()?;
        Ok(())
    }
}

/// Server listener and connection ceiling, shared by all workers.
pub(crate) struct Acceptor {
    listener: std::net::TcpListener,
    live: AtomicUsize,
    rejected: AtomicU64,
    max_connections: usize,
}

impl Acceptor {
    /// `listener` must already be non-blocking.
    pub(crate) fn new(listener: std::net::TcpListener, max_connections: usize) -> Self {
        Self {
            listener,
            live: AtomicUsize::new(0),
            rejected: AtomicU64::new(0),
            max_connections,
        }
    }

    pub(crate) fn try_clone_listener(&self) -> io::Result<std::net::TcpListener> {
        self.listener.try_clone()
    }

    /// Claim a connection slot. Counts a rejection when none is left.
    pub(crate) fn try_admit(&self) -> bool {
        if self.live.fetch_add(1, Ordering::AcqRel) < self.max_connections {
            return true;
        }
        self.live.fetch_sub(1, Ordering::AcqRel);
        self.rejected.fetch_add(1, Ordering::Relaxed);
        false
    }

    pub(crate) fn release(&self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub(crate) fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

/// The running set of workers.
pub(crate) struct EventLoopGroup {
    handles: Vec<WorkerHandle>,
    threads: Vec<JoinHandle<()>>,
    next: AtomicUsize,
    shared: Arc<Shared>,
}

impl EventLoopGroup {
    /// Spawn `config.worker_count()` workers. With an acceptor, every
    /// worker also accepts from the shared listener.
    pub(crate) fn start(shared: Arc<Shared>, acceptor: Option<Arc<Acceptor>>) -> io::Result<Self> {
        let count = shared.config.worker_count();
        // Dropping a partially started group stops the workers spawned so far
        let mut group = Self {
            handles: Vec::with_capacity(count),
            threads: Vec::with_capacity(count),
            next: AtomicUsize::new(0),
            shared: Arc::clone(&shared),
        };

        for index in 0..count {
            let poll = Poll::new()?;
            let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
            let (tx, rx) = channel::unbounded();
            let handle = WorkerHandle { index, tx, waker };

            let worker = Worker::new(
                index,
                poll,
                rx,
                handle.clone(),
                Arc::clone(&shared),
                acceptor.clone(),
            )?;
            let thread = thread::Builder::new()
                .name(format!("worker-{index}"))
                .spawn(move || worker.run())?;

            group.handles.push(handle);
            group.threads.push(thread);
        }

        info!(
            workers = count,
            accepting = acceptor.is_some(),
            "Event loop group started"
        );
        Ok(group)
    }

    /// Hand an outbound connection to the next worker, round-robin.
    pub(crate) fn register(&self, stream: TcpStream) -> Result<Session, SessionError> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.handles.len();
        let (reply, rx) = channel::bounded(1);
        self.handles[index].send(Command::Register { stream, reply })?;
        rx.recv()
            .map_err(|_| SessionError::WorkerUnavailable(index))?
    }

    /// Close every session and join the workers. Idempotent.
    pub(crate) fn shutdown(&mut self) {
        if self.threads.is_empty() {
            return;
        }
        for handle in &self.handles {
            if let Err(e) = handle.send(Command::Shutdown) {
                debug!(worker = handle.index(), error = %e, "Worker already stopped");
            }
        }
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                error!("Worker thread panicked");
            }
        }
        self.shared.dispatcher.shutdown();
        info!("Event loop group stopped");
    }
}

impl Drop for EventLoopGroup {
    fn drop(&mut self) {
        self.shutdown();
    }
}
