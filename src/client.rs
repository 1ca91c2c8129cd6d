//! Connecting side of the engine.
//!
//! A client owns its own worker group. Each `connect` opens one outbound
//! connection and hands it to the next worker, which registers it and
//! replies with the session.

use crate::config::Config;
use crate::error::{Error, SessionError};
use crate::handler::MessageHandler;
use crate::protocol::{Codec, CodecRegistry, FrameCodec};
use crate::runtime::{EventLoopGroup, Shared};
use crate::session::Session;
use mio::net::TcpStream;
use std::io;
use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub struct Client {
    group: EventLoopGroup,
    connect_timeout: Duration,
}

impl Client {
    /// Validate `config` and start the client's workers.
    pub fn new(config: Config, handler: Arc<dyn MessageHandler>) -> Result<Self, Error> {
        config.validate()?;
        let codec = FrameCodec::from_config(&config, &CodecRegistry::default())?;
        Self::start(config, handler, Arc::new(codec))
    }

    /// Like [`Client::new`] with a caller-supplied codec.
    pub fn with_codec(
        config: Config,
        handler: Arc<dyn MessageHandler>,
        codec: impl Codec,
    ) -> Result<Self, Error> {
        config.validate()?;
        Self::start(config, handler, Arc::new(codec))
    }

    fn start(
        config: Config,
        handler: Arc<dyn MessageHandler>,
        codec: Arc<dyn Codec>,
    ) -> Result<Self, Error> {
        let connect_timeout = config.connect_timeout();
        let shared = Arc::new(Shared::new(config, codec, handler)?);
        let group = EventLoopGroup::start(shared, None)?;
        Ok(Self {
            group,
            connect_timeout,
        })
    }

    /// Connect to `addr` and return the registered session.
    ///
    /// Each resolved address is tried in turn with the configured connect
    /// timeout; the last failure is returned if none succeeds.
    pub fn connect(&self, addr: impl ToSocketAddrs) -> Result<Session, Error> {
        let mut last_err = None;
        for addr in addr.to_socket_addrs()? {
            match std::net::TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => {
                    stream.set_nonblocking(true)?;
                    let session = self.group.register(TcpStream::from_std(stream))?;
                    debug!(session = session.id(), peer = %addr, "Connected");
                    return Ok(session);
                }
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                    last_err = Some(
                        SessionError::ConnectTimeout {
                            addr,
                            timeout_ms: self.connect_timeout.as_millis() as u64,
                        }
                        .into(),
                    );
                }
                Err(e) => {
                    debug!(peer = %addr, error = %e, "Connect failed");
                    last_err = Some(Error::Io(e));
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "address resolved to nothing").into()
        }))
    }

    /// Close every session and stop the workers.
    pub fn shutdown(&mut self) {
        self.group.shutdown();
        info!("Client stopped");
    }
}
