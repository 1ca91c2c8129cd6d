//! framewire: a framed TCP session engine
//!
//! Turns raw TCP byte streams into typed message sessions:
//! - Length-prefixed binary framing with a header attachment
//! - Pluggable payload serialization and compression
//! - Pooled buffer arena shared by all connections
//! - Per-session write queues with watermark backpressure
//! - Lifecycle events, idle timeouts and heartbeats
//!
//! Both sides of a connection use the same engine: [`Server`] accepts,
//! [`Client`] connects, and each hands out [`Session`] handles.

pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod policy;
pub mod protocol;
pub mod runtime;
pub mod server;
pub mod session;

pub use client::Client;
pub use config::Config;
pub use error::{Error, HandlerError, ProtocolError, SessionError};
pub use handler::{EventKind, MessageHandler};
pub use protocol::{FrameCodec, Headers, Message};
pub use server::Server;
pub use session::{Session, SessionState};
