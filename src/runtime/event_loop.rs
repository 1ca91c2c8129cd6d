//! mio worker loop.
//!
//! Readiness-based: each connection is registered once, edge-triggered, for
//! both readable and writable. Reads drain the socket until `WouldBlock`
//! and decode every complete frame after each read. Writes are driven by
//! the session's write gate: a `Flush` command starts them, and writable
//! readiness resumes them after a short write.
//!
//! ## Flow Control
//!
//! While a session is flow limited its readable events are ignored and the
//! idle sweep leaves it alone. The completion that releases the limit reads
//! the socket directly, since the edge for the buffered input has already
//! been consumed.

use crate::error::ProtocolError;
use crate::handler::EventKind;
use crate::policy::IdleAction;
use crate::protocol::Message;
use crate::runtime::{
    Acceptor, Chunk, Command, ReadBuffer, Shared, WorkerHandle,
};
use crate::session::{Batch, Session, SessionState};
use crossbeam::channel::Receiver;
use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, trace, warn};

pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX);
const LISTENER_TOKEN: Token = Token(usize::MAX - 1);

/// Events drained per poll.
const EVENT_CAPACITY: usize = 1024;

/// Worker-owned half of a session.
struct Connection {
    stream: TcpStream,
    session: Session,
    read_buf: ReadBuffer,
    /// Buffer being written and how much of it has gone out.
    in_flight: Option<(Chunk, usize)>,
    /// Counts against the server's connection ceiling.
    accepted: bool,
    last_read: Instant,
    last_heartbeat: Instant,
}

pub(crate) struct Worker {
    index: usize,
    poll: Poll,
    inbox: Receiver<Command>,
    handle: WorkerHandle,
    shared: Arc<Shared>,
    listener: Option<TcpListener>,
    acceptor: Option<Arc<Acceptor>>,
    connections: Slab<Connection>,
    running: bool,
}

impl Worker {
    pub(crate) fn new(
        index: usize,
        poll: Poll,
        inbox: Receiver<Command>,
        handle: WorkerHandle,
        shared: Arc<Shared>,
        acceptor: Option<Arc<Acceptor>>,
    ) -> io::Result<Self> {
        let listener = match &acceptor {
            Some(acceptor) => {
                let mut listener = TcpListener::from_std(acceptor.try_clone_listener()?);
                poll.registry()
                    .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
                Some(listener)
            }
            None => None,
        };

        Ok(Self {
            index,
            poll,
            inbox,
            handle,
            shared,
            listener,
            acceptor,
            connections: Slab::new(),
            running: true,
        })
    }

    /// Run until shutdown, then close every remaining session.
    pub(crate) fn run(mut self) {
        debug!(worker = self.index, "Worker started");
        if let Err(e) = self.event_loop() {
            error!(worker = self.index, error = %e, "Worker failed");
        }
        self.close_all();
        if let Some(mut listener) = self.listener.take() {
            let _ = self.poll.registry().deregister(&mut listener);
        }
        info!(worker = self.index, "Worker stopped");
    }

    fn event_loop(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(EVENT_CAPACITY);
        let tick = self.shared.policy.tick_interval();
        let mut last_sweep = Instant::now();

        while self.running {
            match self.poll.poll(&mut events, tick) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            for event in events.iter() {
                match event.token() {
                    WAKER_TOKEN => self.drain_inbox(),
                    LISTENER_TOKEN => self.accept_connections(),
                    Token(key) => self.handle_connection_event(key, event),
                }
            }

            if let Some(tick) = tick {
                if last_sweep.elapsed() >= tick {
                    self.sweep_idle();
                    last_sweep = Instant::now();
                }
            }
        }
        Ok(())
    }

    fn drain_inbox(&mut self) {
        while let Ok(command) = self.inbox.try_recv() {
            match command {
                Command::Register { stream, reply } => {
                    let result = self.register(stream, false).map_err(Into::into);
                    // The caller may have given up waiting
                    let _ = reply.send(result);
                }
                Command::Flush { key, id } => {
                    if self.owns(key, id) {
                        self.flush(key);
                    }
                }
                Command::Close { key, id } => {
                    if self.owns(key, id) {
                        self.close_connection(key);
                    }
                }
                Command::Shutdown => self.running = false,
            }
        }
    }

    /// Slab keys are reused, so commands carry the session id too.
    fn owns(&self, key: usize, id: u64) -> bool {
        self.connections
            .get(key)
            .is_some_and(|conn| conn.session.id() == id)
    }

    fn accept_connections(&mut self) {
        let Some(acceptor) = self.acceptor.clone() else {
            return;
        };
        loop {
            let accepted = match &self.listener {
                Some(listener) => listener.accept(),
                None => return,
            };
            match accepted {
                Ok((stream, peer)) => {
                    if !acceptor.try_admit() {
                        warn!(
                            worker = self.index,
                            peer = %peer,
                            max_connections = self.shared.config.max_connections,
                            "Connection limit reached, rejecting"
                        );
                        drop(stream);
                        continue;
                    }
                    if let Err(e) = self.register(stream, true) {
                        acceptor.release();
                        warn!(worker = self.index, peer = %peer, error = %e, "Failed to register connection");
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(worker = self.index, error = %e, "Accept error");
                    break;
                }
            }
        }
    }

    fn register(&mut self, mut stream: TcpStream, accepted: bool) -> io::Result<Session> {
        let entry = self.connections.vacant_entry();
        let key = entry.key();
        let id = self
            .shared
            .next_session_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        if let Err(e) = stream.set_nodelay(true) {
            trace!(session = id, error = %e, "Failed to set TCP_NODELAY");
        }
        let local_addr = stream.local_addr().ok();
        let peer_addr = stream.peer_addr().ok();

        self.poll.registry().register(
            &mut stream,
            Token(key),
            Interest::READABLE | Interest::WRITABLE,
        )?;

        let session = Session::new(
            id,
            key,
            local_addr,
            peer_addr,
            self.handle.clone(),
            Arc::clone(&self.shared),
        );
        let chunk = self
            .shared
            .arena
            .allocate_near(self.index, self.shared.config.read_buffer_size);
        let now = Instant::now();
        entry.insert(Connection {
            stream,
            session: session.clone(),
            read_buf: ReadBuffer::new(chunk),
            in_flight: None,
            accepted,
            last_read: now,
            last_heartbeat: now,
        });

        debug!(
            worker = self.index,
            session = id,
            peer = ?peer_addr,
            accepted,
            "Session registered"
        );
        session.fire(EventKind::NewSession, None);
        Ok(session)
    }

    fn handle_connection_event(&mut self, key: usize, event: &Event) {
        if !self.connections.contains(key) {
            return;
        }
        if event.is_readable() || event.is_read_closed() || event.is_error() {
            self.handle_readable(key);
        }
        // Re-check: the read path may have closed it
        if event.is_writable() && self.connections.contains(key) {
            self.flush(key);
        }
    }

    /// Read until the socket would block, decoding after every read.
    fn handle_readable(&mut self, key: usize) {
        loop {
            let Some(conn) = self.connections.get_mut(key) else {
                return;
            };
            if conn.session.state() != SessionState::Enabled || conn.session.is_flow_limited() {
                return;
            }

            conn.read_buf.compact();
            if conn.read_buf.is_full() {
                let err = ProtocolError::BufferFull {
                    capacity: conn.read_buf.capacity(),
                };
                warn!(session = conn.session.id(), error = %err, "Read buffer full");
                let session = conn.session.clone();
                session.fire(EventKind::DecodeError, Some(&err));
                self.close_connection(key);
                return;
            }

            match conn.stream.read(conn.read_buf.append_capacity()) {
                Ok(0) => {
                    trace!(session = conn.session.id(), "Peer shut down input");
                    let session = conn.session.clone();
                    session.fire(EventKind::InputShutdown, None);
                    if session.begin_graceful_close() {
                        self.close_connection(key);
                    }
                    return;
                }
                Ok(n) => {
                    conn.read_buf.commit(n);
                    conn.last_read = Instant::now();
                    if !self.decode_frames(key) {
                        return;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(session = conn.session.id(), error = %e, "Read failed");
                    let session = conn.session.clone();
                    session.fire(EventKind::InputError, Some(&e));
                    self.close_connection(key);
                    return;
                }
            }
        }
    }

    /// Decode and dispatch every complete frame. Returns `false` once the
    /// connection is gone.
    fn decode_frames(&mut self, key: usize) -> bool {
        loop {
            let Some(conn) = self.connections.get_mut(key) else {
                return false;
            };
            if conn.session.state() == SessionState::Closed {
                return false;
            }

            match self.shared.codec.decode(&mut conn.read_buf) {
                Ok(Some(mut message)) => {
                    let session = conn.session.clone();
                    message.set_addrs(session.local_addr(), session.peer_addr());
                    match message.heartbeat_kind().map(|kind| kind == "ping") {
                        Some(true) => {
                            trace!(session = session.id(), "Heartbeat ping, answering");
                            if let Err(e) = session.send(&Message::heartbeat("pong")) {
                                trace!(session = session.id(), error = %e, "Heartbeat reply dropped");
                            }
                        }
                        Some(false) => trace!(session = session.id(), "Heartbeat reply"),
                        None => self.shared.dispatcher.dispatch(&session, message),
                    }
                }
                Ok(None) => return true,
                Err(e) => {
                    warn!(session = conn.session.id(), error = %e, "Protocol violation, closing session");
                    let session = conn.session.clone();
                    session.fire(EventKind::DecodeError, Some(&e));
                    self.close_connection(key);
                    return false;
                }
            }
        }
    }

    /// Write queued output until the socket would block or the queue is
    /// empty.
    fn flush(&mut self, key: usize) {
        loop {
            let Some(conn) = self.connections.get_mut(key) else {
                return;
            };

            if conn.in_flight.is_none() {
                match conn.session.next_batch() {
                    Batch::Write(chunk) => conn.in_flight = Some((chunk, 0)),
                    Batch::Idle => return,
                    Batch::Drained => {
                        debug!(session = conn.session.id(), "Output drained, closing");
                        self.close_connection(key);
                        return;
                    }
                }
            }
            let Some((chunk, written)) = conn.in_flight.as_mut() else {
                return;
            };

            match conn.stream.write(&chunk[*written..]) {
                Ok(0) => {
                    self.fail_output(key, io::Error::from(io::ErrorKind::WriteZero));
                    return;
                }
                Ok(n) => {
                    *written += n;
                    if *written < chunk.len() {
                        continue;
                    }
                    let len = chunk.len();
                    conn.in_flight = None;
                    trace!(session = conn.session.id(), len, "Write complete");

                    if conn.session.complete_write(len) {
                        // The idle clock restarts when reads resume
                        conn.last_read = Instant::now();
                        let session = conn.session.clone();
                        debug!(session = session.id(), "Write queue below low watermark, resuming reads");
                        session.fire(EventKind::ReleaseFlowLimit, None);
                        self.handle_readable(key);
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.fail_output(key, e);
                    return;
                }
            }
        }
    }

    fn fail_output(&mut self, key: usize, err: io::Error) {
        if let Some(conn) = self.connections.get(key) {
            debug!(session = conn.session.id(), error = %err, "Write failed");
            let session = conn.session.clone();
            session.fire(EventKind::OutputError, Some(&err));
        }
        self.close_connection(key);
    }

    /// Close idle sessions and ping quiet ones.
    fn sweep_idle(&mut self) {
        let now = Instant::now();
        let policy = self.shared.policy;
        let mut idle = Vec::new();
        let mut quiet = Vec::new();

        for (key, conn) in self.connections.iter_mut() {
            // Reads are suspended by backpressure, not by a quiet peer
            if conn.session.is_flow_limited() {
                continue;
            }
            let since_read = now.saturating_duration_since(conn.last_read);
            let since_heartbeat = now.saturating_duration_since(conn.last_heartbeat);
            match policy.check(since_read, since_heartbeat) {
                IdleAction::Close => idle.push((key, conn.session.clone())),
                IdleAction::Heartbeat => {
                    conn.last_heartbeat = now;
                    quiet.push(conn.session.clone());
                }
                IdleAction::None => {}
            }
        }

        for session in quiet {
            trace!(session = session.id(), "Sending heartbeat");
            if let Err(e) = session.send(&Message::heartbeat("ping")) {
                trace!(session = session.id(), error = %e, "Heartbeat not sent");
            }
        }
        for (key, session) in idle {
            debug!(session = session.id(), "Idle timeout, closing session");
            session.fire(EventKind::IdleTimeout, None);
            self.close_connection(key);
        }
    }

    /// Remove the connection and fire `SessionClosed`. No-op for unknown keys.
    fn close_connection(&mut self, key: usize) {
        let Some(mut conn) = self.connections.try_remove(key) else {
            return;
        };
        conn.session.mark_closed();
        if let Err(e) = self.poll.registry().deregister(&mut conn.stream) {
            trace!(session = conn.session.id(), error = %e, "Deregister failed");
        }
        if conn.accepted {
            if let Some(acceptor) = &self.acceptor {
                acceptor.release();
            }
        }

        let session = conn.session.clone();
        // Closes the socket and returns the read buffer and any in-flight
        // chunk to the arena
        drop(conn);
        debug!(worker = self.index, session = session.id(), "Session closed");
        session.fire(EventKind::SessionClosed, None);
    }

    fn close_all(&mut self) {
        let keys: Vec<usize> = self.connections.iter().map(|(key, _)| key).collect();
        for key in keys {
            self.close_connection(key);
        }
    }
}
