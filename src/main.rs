//! framewire: framed TCP session engine
//!
//! Runs an echo server: every decoded message is sent back to the session
//! it arrived on, headers and payload unchanged.
//!
//! Configuration via CLI arguments or TOML file.

use framewire::{Config, HandlerError, Message, MessageHandler, Server, Session};
use std::sync::Arc;
use std::thread;
use tracing::{info, trace};
use tracing_subscriber::EnvFilter;

struct EchoHandler;

impl MessageHandler for EchoHandler {
    fn on_message(&self, session: &Session, message: Message) -> Result<(), HandlerError> {
        trace!(
            session = session.id(),
            len = message.payload().len(),
            "Echoing message"
        );
        session.send(&message)?;
        Ok(())
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        workers = config.worker_count(),
        max_connections = config.max_connections,
        max_content_length = config.max_content_length,
        serializer = %config.serializer,
        compressor = %config.compressor,
        "Starting framewire echo server"
    );

    let mut server = Server::new(config, Arc::new(EchoHandler))?;
    server.start()?;

    // Workers run until the process is killed
    loop {
        thread::park();
    }
}
