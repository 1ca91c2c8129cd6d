//! Message handlers and dispatch.
//!
//! Decoded messages are handed to a [`MessageHandler`] either directly on
//! the session's I/O worker (strict per-session ordering) or through a
//! bounded pool of handler threads. With the pool, messages of one session
//! may be processed concurrently and out of order.
//!
//! Handler errors and panics are caught per message and reported as
//! [`EventKind::ProcessError`]; they never close the connection.

use crate::error::HandlerError;
use crate::protocol::Message;
use crate::session::Session;
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use std::any::Any;
use std::error::Error as StdError;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, trace, warn};

/// Session lifecycle and failure notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Session registered with a worker and reading.
    NewSession,
    /// Peer closed its write side (EOF).
    InputShutdown,
    /// Handler returned an error or panicked.
    ProcessError,
    /// Frame violated the protocol; the session is closed.
    DecodeError,
    /// Socket read failed; the session is closed.
    InputError,
    /// Socket write failed; the session is closed.
    OutputError,
    /// Graceful close started; pending output is draining.
    SessionClosing,
    /// Terminal event, fired exactly once per session.
    SessionClosed,
    /// Write queue crossed the high watermark; reads are suspended.
    FlowLimit,
    /// Write queue fell below the low watermark; reads resume.
    ReleaseFlowLimit,
    /// No inbound traffic within the idle timeout; the session is closed.
    IdleTimeout,
}

/// Application callbacks.
///
/// Both methods may run on any worker or handler thread.
pub trait MessageHandler: Send + Sync + 'static {
    /// Process one decoded message.
    fn on_message(&self, session: &Session, message: Message) -> Result<(), HandlerError>;

    /// Observe a session event; `cause` is set for failure events.
    fn on_event(
        &self,
        session: &Session,
        kind: EventKind,
        cause: Option<&(dyn StdError + 'static)>,
    ) {
        let _ = cause;
        trace!(session = session.id(), event = ?kind, "Session event");
    }
}

/// A handler panicked while processing a message.
#[derive(Debug, thiserror::Error)]
#[error("handler panicked: {0}")]
pub struct HandlerPanic(pub String);

/// Run the session's handler for one message, containing failures.
pub(crate) fn invoke(session: &Session, message: Message) {
    let handler = session.handler();
    match panic::catch_unwind(AssertUnwindSafe(|| handler.on_message(session, message))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            debug!(session = session.id(), error = %e, "Handler error");
            session.fire(EventKind::ProcessError, Some(&*e));
        }
        Err(payload) => {
            let err = HandlerPanic(panic_message(payload.as_ref()));
            error!(session = session.id(), error = %err, "Handler panicked");
            session.fire(EventKind::ProcessError, Some(&err));
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

enum Job {
    Run(Session, Message),
    Stop,
}

/// Where decoded messages are processed.
pub(crate) enum Dispatcher {
    /// On the I/O worker, in arrival order.
    Inline,
    /// On a bounded pool of handler threads.
    Pool(DispatchPool),
}

impl Dispatcher {
    pub(crate) fn new(threads: usize, queue_capacity: usize) -> std::io::Result<Self> {
        if threads == 0 {
            Ok(Dispatcher::Inline)
        } else {
            Ok(Dispatcher::Pool(DispatchPool::new(threads, queue_capacity)?))
        }
    }

    pub(crate) fn dispatch(&self, session: &Session, message: Message) {
        match self {
            Dispatcher::Inline => invoke(session, message),
            Dispatcher::Pool(pool) => pool.submit(session, message),
        }
    }

    pub(crate) fn shutdown(&self) {
        if let Dispatcher::Pool(pool) = self {
            pool.shutdown();
        }
    }
}

/// Fixed set of handler threads fed by a bounded queue.
///
/// When the queue is full the submitting worker runs the handler itself,
/// so a slow handler slows that worker's reads instead of growing memory.
pub(crate) struct DispatchPool {
    tx: Sender<Job>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl DispatchPool {
    fn new(threads: usize, queue_capacity: usize) -> std::io::Result<Self> {
        let (tx, rx) = channel::bounded(queue_capacity);
        let mut handles = Vec::with_capacity(threads);
        for i in 0..threads {
            let rx: Receiver<Job> = rx.clone();
            handles.push(
                thread::Builder::new()
                    .name(format!("dispatch-{i}"))
                    .spawn(move || {
                        while let Ok(Job::Run(session, message)) = rx.recv() {
                            invoke(&session, message);
                        }
                    })?,
            );
        }
        debug!(threads, queue_capacity, "Dispatch pool started");
        Ok(Self {
            tx,
            threads: Mutex::new(handles),
        })
    }

    fn submit(&self, session: &Session, message: Message) {
        match self.tx.try_send(Job::Run(session.clone(), message)) {
            Ok(()) => {}
            Err(TrySendError::Full(Job::Run(session, message))) => {
                trace!(session = session.id(), "Dispatch queue full, running inline");
                invoke(&session, message);
            }
            Err(TrySendError::Disconnected(Job::Run(session, message))) => {
                warn!(session = session.id(), "Dispatch pool stopped, running inline");
                invoke(&session, message);
            }
            Err(_) => {}
        }
    }

    /// Stop and join every handler thread after queued jobs finish.
    fn shutdown(&self) {
        let handles = std::mem::take(&mut *self.threads.lock().unwrap_or_else(|e| e.into_inner()));
        for _ in 0..handles.len() {
            let _ = self.tx.send(Job::Stop);
        }
        for handle in handles {
            if handle.join().is_err() {
                error!("Dispatch thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        let payload = panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload = panic::catch_unwind(|| panic!("code {}", 7)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "code 7");

        let payload = panic::catch_unwind(|| std::panic::panic_any(42u8)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
