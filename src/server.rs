//! Listening side of the engine.
//!
//! One listening socket is bound with `socket2` and cloned into every
//! worker's poll; whichever worker wins `accept` owns the connection.
//! Connections past `max_connections` are closed as soon as they are
//! accepted, before a session exists.

use crate::config::Config;
use crate::error::Error;
use crate::handler::MessageHandler;
use crate::protocol::{Codec, CodecRegistry, FrameCodec};
use crate::runtime::{Acceptor, EventLoopGroup, Shared};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use tracing::info;

/// Accept backlog for the listening socket.
const BACKLOG: i32 = 1024;

/// A server instance
pub struct Server {
    config: Config,
    codec: Arc<dyn Codec>,
    handler: Arc<dyn MessageHandler>,
    running: Option<Running>,
}

struct Running {
    group: EventLoopGroup,
    acceptor: Arc<Acceptor>,
    local_addr: SocketAddr,
}

impl Server {
    /// Validate `config` and resolve its codecs from the built-in registry.
    pub fn new(config: Config, handler: Arc<dyn MessageHandler>) -> Result<Self, Error> {
        config.validate()?;
        let codec = FrameCodec::from_config(&config, &CodecRegistry::default())?;
        Ok(Self::build(config, handler, Arc::new(codec)))
    }

    /// Like [`Server::new`] with a caller-supplied codec, e.g. a
    /// `FrameCodec` using codecs from a custom registry.
    pub fn with_codec(
        config: Config,
        handler: Arc<dyn MessageHandler>,
        codec: impl Codec,
    ) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self::build(config, handler, Arc::new(codec)))
    }

    fn build(config: Config, handler: Arc<dyn MessageHandler>, codec: Arc<dyn Codec>) -> Self {
        Self {
            config,
            codec,
            handler,
            running: None,
        }
    }

    /// Bind, start the workers and return the bound address.
    pub fn start(&mut self) -> Result<SocketAddr, Error> {
        if self.running.is_some() {
            return Err(Error::AlreadyStarted);
        }

        let addr = resolve(&self.config.listen)?;
        let listener = create_listener(addr)?;
        let local_addr = listener.local_addr()?;
        let acceptor = Arc::new(Acceptor::new(listener, self.config.max_connections));

        let shared = Arc::new(Shared::new(
            self.config.clone(),
            Arc::clone(&self.codec),
            Arc::clone(&self.handler),
        )?);
        let group = EventLoopGroup::start(shared, Some(Arc::clone(&acceptor)))?;

        info!(
            address = %local_addr,
            workers = self.config.worker_count(),
            max_connections = self.config.max_connections,
            "Server listening"
        );
        self.running = Some(Running {
            group,
            acceptor,
            local_addr,
        });
        Ok(local_addr)
    }

    /// Bound address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Sessions currently counted against `max_connections`.
    pub fn live_connections(&self) -> usize {
        self.running.as_ref().map_or(0, |r| r.acceptor.live())
    }

    /// Accepted sockets closed because the ceiling was reached.
    pub fn rejected_connections(&self) -> u64 {
        self.running.as_ref().map_or(0, |r| r.acceptor.rejected())
    }

    /// Close every session, stop the workers and release the port.
    pub fn stop(&mut self) {
        if let Some(mut running) = self.running.take() {
            running.group.shutdown();
            info!(address = %running.local_addr, "Server stopped");
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

fn resolve(listen: &str) -> io::Result<SocketAddr> {
    listen.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("listen address {listen} resolved to nothing"),
        )
    })
}

/// Create a non-blocking TCP listener with SO_REUSEADDR.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::handler::EventKind;
    use crate::protocol::Message;
    use crate::session::SessionState;
    use crate::test_util::{test_config, wait_until, Recorder};
    use bytes::Bytes;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::thread;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn start(config: Config, handler: Arc<Recorder>) -> (Server, SocketAddr) {
        let mut server = Server::new(config, handler).unwrap();
        let addr = server.start().unwrap();
        (server, addr)
    }

    fn client(handler: Arc<Recorder>) -> Client {
        Client::new(test_config(), handler).unwrap()
    }

    #[test]
    fn test_echo_round_trip() {
        let (_server, addr) = start(test_config(), Arc::new(Recorder::echo()));
        let replies = Arc::new(Recorder::new());
        let client = client(replies.clone());
        let session = client.connect(addr).unwrap();

        let message = Message::new(Bytes::from_static(b"hello")).header("k", "v");
        session.send(&message).unwrap();

        assert!(wait_until(TIMEOUT, || replies.message_count() == 1));
        let reply = &replies.messages()[0];
        assert_eq!(reply, &message);
        assert_eq!(reply.headers().get("k"), Some("v"));
        assert_eq!(reply.peer_addr(), Some(addr));
        assert_eq!(replies.count_for(session.id(), EventKind::NewSession), 1);
    }

    #[test]
    fn test_start_twice() {
        let (mut server, addr) = start(test_config(), Arc::new(Recorder::new()));
        assert_eq!(server.local_addr(), Some(addr));
        assert!(matches!(server.start(), Err(Error::AlreadyStarted)));
        server.stop();
        assert!(!server.is_running());
        assert_eq!(server.local_addr(), None);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = test_config();
        config.low_watermark = 0.95;
        assert!(matches!(
            Server::new(config, Arc::new(Recorder::new())),
            Err(Error::Config(_))
        ));

        let mut config = test_config();
        config.compressor = "zstd".to_string();
        assert!(matches!(
            Server::new(config, Arc::new(Recorder::new())),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_graceful_close_delivers_queued_output() {
        let received = Arc::new(Recorder::new());
        let (_server, addr) = start(test_config(), received.clone());
        let events = Arc::new(Recorder::new());
        let client = client(events.clone());
        let session = client.connect(addr).unwrap();

        for i in 0..50 {
            session.send(&Message::new(format!("message {i}"))).unwrap();
        }
        session.close(false);
        assert!(session.send(&Message::new("late")).is_err());

        assert!(wait_until(TIMEOUT, || received.message_count() == 50));
        let payloads: Vec<Bytes> = received
            .messages()
            .into_iter()
            .map(Message::into_payload)
            .collect();
        assert_eq!(payloads[0], Bytes::from("message 0"));
        assert_eq!(payloads[49], Bytes::from("message 49"));

        assert!(wait_until(TIMEOUT, || session.state() == SessionState::Closed));
        assert!(wait_until(TIMEOUT, || {
            events.count_for(session.id(), EventKind::SessionClosed) == 1
        }));
        // Server side sees EOF and closes too
        assert!(wait_until(TIMEOUT, || received.count(EventKind::SessionClosed) == 1));
    }

    #[test]
    fn test_close_is_idempotent() {
        let (_server, addr) = start(test_config(), Arc::new(Recorder::new()));
        let events = Arc::new(Recorder::new());
        let client = client(events.clone());
        let session = client.connect(addr).unwrap();

        session.close(true);
        session.close(true);
        session.close(false);
        assert_eq!(session.state(), SessionState::Closed);
        assert!(matches!(
            session.send(&Message::new("x")),
            Err(crate::SessionError::Closed(_))
        ));

        assert!(wait_until(TIMEOUT, || {
            events.count_for(session.id(), EventKind::SessionClosed) == 1
        }));
        thread::sleep(Duration::from_millis(100));
        session.close(true);
        assert_eq!(events.count_for(session.id(), EventKind::SessionClosed), 1);
    }

    #[test]
    fn test_oversized_frame_closes_session() {
        let mut config = test_config();
        config.max_content_length = 1024;
        let received = Arc::new(Recorder::new());
        let (_server, addr) = start(config, received.clone());
        let client = client(Arc::new(Recorder::new()));
        let session = client.connect(addr).unwrap();

        session.send(&Message::new(vec![7u8; 2048])).unwrap();

        assert!(wait_until(TIMEOUT, || received.count(EventKind::DecodeError) == 1));
        assert!(wait_until(TIMEOUT, || received.count(EventKind::SessionClosed) == 1));
        let server_session = received.session_with(EventKind::DecodeError).unwrap();
        assert_eq!(server_session.state(), SessionState::Closed);
        assert_eq!(received.message_count(), 0);

        // The peer observes the close
        assert!(wait_until(TIMEOUT, || session.state() == SessionState::Closed));
    }

    #[test]
    fn test_frame_larger_than_read_buffer_closes_session() {
        let mut config = test_config();
        config.read_buffer_size = 1024;
        config.max_content_length = 1000;
        let received = Arc::new(Recorder::new());
        // The codec accepts the frame, the read buffer cannot hold it
        let mut server =
            Server::with_codec(config, received.clone(), FrameCodec::new(8192)).unwrap();
        let addr = server.start().unwrap();

        let mut stream = TcpStream::connect(addr).unwrap();
        let frame = FrameCodec::new(8192)
            .encode_to_bytes(&Message::new(vec![3u8; 4000]))
            .unwrap();
        stream.write_all(&frame).unwrap();

        assert!(wait_until(TIMEOUT, || received.count(EventKind::DecodeError) == 1));
        assert!(wait_until(TIMEOUT, || received.count(EventKind::SessionClosed) == 1));
        let session = received.session_with(EventKind::DecodeError).unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(received.message_count(), 0);

        // The peer sees EOF or a reset
        let mut buf = [0u8; 16];
        stream.set_read_timeout(Some(TIMEOUT)).unwrap();
        assert!(matches!(stream.read(&mut buf), Ok(0) | Err(_)));
        assert!(wait_until(TIMEOUT, || server.live_connections() == 0));
    }

    #[test]
    fn test_connection_ceiling() {
        let mut config = test_config();
        config.max_connections = 4;
        let events = Arc::new(Recorder::new());
        let (server, addr) = start(config, events.clone());

        let streams: Vec<TcpStream> = (0..8).map(|_| TcpStream::connect(addr).unwrap()).collect();
        assert!(wait_until(TIMEOUT, || {
            server.live_connections() == 4 && server.rejected_connections() == 4
        }));
        assert!(wait_until(TIMEOUT, || events.count(EventKind::NewSession) == 4));

        let mut closed = 0;
        for mut stream in streams {
            stream
                .set_read_timeout(Some(Duration::from_millis(200)))
                .unwrap();
            let mut buf = [0u8; 16];
            if let Ok(0) = stream.read(&mut buf) {
                closed += 1;
            }
        }
        assert_eq!(closed, 4);
        // Dropping the streams frees the slots
        assert!(wait_until(TIMEOUT, || server.live_connections() == 0));
    }

    #[test]
    fn test_handler_failures_are_isolated() {
        let handler = Arc::new(Recorder::with(|session, message| {
            match message.payload().as_ref() {
                b"fail" => return Err("refused".into()),
                b"panic" => panic!("handler blew up"),
                _ => {}
            }
            session.send(message)?;
            Ok(())
        }));
        let (_server, addr) = start(test_config(), handler.clone());
        let replies = Arc::new(Recorder::new());
        let client = client(replies.clone());
        let session = client.connect(addr).unwrap();

        session.send(&Message::new("fail")).unwrap();
        session.send(&Message::new("panic")).unwrap();
        session.send(&Message::new("ok")).unwrap();

        assert!(wait_until(TIMEOUT, || replies.message_count() == 1));
        assert_eq!(replies.messages()[0].payload().as_ref(), b"ok");
        assert_eq!(handler.count(EventKind::ProcessError), 2);
        assert!(session.is_open());
    }

    #[test]
    fn test_dispatch_pool() {
        let mut config = test_config();
        config.dispatch_threads = 4;
        config.dispatch_queue_capacity = 16;
        let (_server, addr) = start(config, Arc::new(Recorder::echo()));
        let replies = Arc::new(Recorder::new());
        let client = client(replies.clone());
        let session = client.connect(addr).unwrap();

        for i in 0..100 {
            session.send(&Message::new(format!("{i}"))).unwrap();
        }
        assert!(wait_until(TIMEOUT, || replies.message_count() == 100));
        let mut seen: Vec<usize> = replies
            .messages()
            .iter()
            .map(|m| std::str::from_utf8(m.payload()).unwrap().parse().unwrap())
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_slow_consumer_suspends_reads() {
        const REQUESTS: usize = 1000;
        const RESPONSE_LEN: usize = 60 * 1024;

        let mut config = test_config();
        config.write_queue_capacity = 256 * 1024;
        let handler = Arc::new(Recorder::with(|session, _| {
            session.send(&Message::new(vec![1u8; RESPONSE_LEN]))?;
            Ok(())
        }));
        let (_server, addr) = start(config, handler.clone());

        let mut stream = TcpStream::connect(addr).unwrap();
        let mut writer = stream.try_clone().unwrap();
        let request = FrameCodec::new(4096)
            .encode_to_bytes(&Message::new(vec![0u8; 1024]))
            .unwrap();
        let sender = thread::spawn(move || {
            for _ in 0..REQUESTS {
                writer.write_all(&request).unwrap();
            }
        });

        // Nobody reads: the server queue crosses the high watermark
        assert!(wait_until(TIMEOUT, || handler.count(EventKind::FlowLimit) >= 1));
        let session = handler.session_with(EventKind::FlowLimit).unwrap();
        assert!(session.is_flow_limited());
        thread::sleep(Duration::from_millis(100));
        let dispatched = handler.message_count();
        thread::sleep(Duration::from_millis(200));
        assert_eq!(handler.message_count(), dispatched);
        assert!(dispatched < REQUESTS);

        // Draining releases the limit and every request is answered
        let expected = REQUESTS * (crate::protocol::HEADER_LEN + RESPONSE_LEN);
        let mut buf = vec![0u8; 64 * 1024];
        let mut total = 0;
        stream.set_read_timeout(Some(TIMEOUT)).unwrap();
        while total < expected {
            let n = stream.read(&mut buf).unwrap();
            assert!(n > 0, "server closed after {total} bytes");
            total += n;
        }
        assert_eq!(total, expected);
        sender.join().unwrap();

        assert_eq!(handler.message_count(), REQUESTS);
        assert!(handler.count(EventKind::ReleaseFlowLimit) >= 1);
    }

    #[test]
    fn test_flow_limited_session_is_not_idle() {
        let mut config = test_config();
        config.idle_timeout_ms = 300;
        config.write_queue_capacity = 256 * 1024;
        let handler = Arc::new(Recorder::with(|session, _| {
            session.send(&Message::new(vec![1u8; 60 * 1024]))?;
            Ok(())
        }));
        let (_server, addr) = start(config, handler.clone());

        // Keeps sending, never reads
        let stream = TcpStream::connect(addr).unwrap();
        let mut writer = stream.try_clone().unwrap();
        writer.set_write_timeout(Some(TIMEOUT)).unwrap();
        let request = FrameCodec::new(4096)
            .encode_to_bytes(&Message::new(vec![0u8; 1024]))
            .unwrap();
        let sender = thread::spawn(move || {
            while writer.write_all(&request).is_ok() {
                thread::sleep(Duration::from_millis(1));
            }
        });

        assert!(wait_until(TIMEOUT, || handler.count(EventKind::FlowLimit) >= 1));
        let session = handler.session_with(EventKind::FlowLimit).unwrap();

        // Several idle timeouts pass with reads suspended
        thread::sleep(Duration::from_millis(1000));
        assert_eq!(handler.count(EventKind::IdleTimeout), 0);
        assert_eq!(session.state(), SessionState::Enabled);
        assert!(session.is_flow_limited());

        stream.shutdown(std::net::Shutdown::Both).unwrap();
        sender.join().unwrap();
    }

    #[test]
    fn test_idle_timeout_closes_session() {
        let mut config = test_config();
        config.idle_timeout_ms = 200;
        let events = Arc::new(Recorder::new());
        let (_server, addr) = start(config, events.clone());
        let client = client(Arc::new(Recorder::new()));
        let session = client.connect(addr).unwrap();

        assert!(wait_until(TIMEOUT, || events.count(EventKind::IdleTimeout) == 1));
        assert!(wait_until(TIMEOUT, || events.count(EventKind::SessionClosed) == 1));
        assert!(wait_until(TIMEOUT, || session.state() == SessionState::Closed));
    }

    #[test]
    fn test_heartbeats_keep_session_alive() {
        let mut config = test_config();
        config.idle_timeout_ms = 300;
        let events = Arc::new(Recorder::new());
        let (_server, addr) = start(config, events.clone());

        let mut client_config = test_config();
        client_config.heartbeat_interval_ms = 50;
        let client = Client::new(client_config, Arc::new(Recorder::new())).unwrap();
        let session = client.connect(addr).unwrap();

        thread::sleep(Duration::from_millis(1000));
        assert_eq!(events.count(EventKind::IdleTimeout), 0);
        assert!(session.is_open());
        // Pings and pongs never reach a handler
        assert_eq!(events.message_count(), 0);
    }
}
