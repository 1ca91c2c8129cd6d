//! Error types for the session engine.
//!
//! Errors are split by the layer that detects them:
//! - [`ProtocolError`]: malformed or over-limit frames (fatal to one connection)
//! - [`SessionError`]: failures surfaced through a [`Session`](crate::Session) handle
//! - [`ConfigError`]: invalid configuration, raised once at startup
//! - [`Error`]: umbrella for `Server` and `Client` entry points

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Error returned by a [`MessageHandler`](crate::MessageHandler).
///
/// Handler errors are isolated per message and never close the connection.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Frame-level protocol violations.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Announced attachment + payload length exceeds the configured maximum.
    ///
    /// Detected from the header, before any payload is buffered.
    #[error("frame too large: {size} bytes exceeds maximum {max} bytes")]
    FrameTooLarge {
        /// Announced (or encoded) content length.
        size: usize,
        /// Configured maximum content length.
        max: usize,
    },

    /// A length field decoded to a negative value.
    #[error("invalid {field} length {value}")]
    InvalidLength {
        /// Which length field was invalid.
        field: &'static str,
        /// The raw signed value.
        value: i32,
    },

    /// The attachment segment is not a valid `key=value` list.
    #[error("malformed attachment: {reason}")]
    MalformedAttachment {
        /// Description of the problem.
        reason: String,
    },

    /// The read buffer filled up without containing a complete frame.
    #[error("read buffer full ({capacity} bytes) without a frame boundary")]
    BufferFull {
        /// Capacity of the read buffer.
        capacity: usize,
    },

    /// Payload serializer or compressor failed.
    #[error("{stage} failed: {reason}")]
    Codec {
        /// Stage that failed (`serialize`, `decompress`, ...).
        stage: &'static str,
        /// Description from the codec.
        reason: String,
    },
}

/// Errors surfaced through a session handle or a connect attempt.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The session is draining its output and accepts no new writes.
    #[error("session {0} is closing")]
    Closing(u64),

    /// The session has been closed.
    #[error("session {0} is closed")]
    Closed(u64),

    /// Connecting did not complete within the configured timeout.
    #[error("connect to {addr} timed out after {timeout_ms} ms")]
    ConnectTimeout {
        /// Target address.
        addr: std::net::SocketAddr,
        /// Configured timeout in milliseconds.
        timeout_ms: u64,
    },

    /// The owning worker has shut down and can no longer accept commands.
    #[error("worker {0} is unavailable")]
    WorkerUnavailable(usize),

    /// Encoding an outbound message failed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Underlying socket error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config file '{}': {source}", .path.display())]
    FileRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The configuration file is not valid TOML for [`TomlConfig`](crate::config::TomlConfig).
    #[error("failed to parse config file '{}': {source}", .path.display())]
    TomlParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// A value or a relationship between values is invalid.
    #[error("invalid configuration for `{field}`: {reason}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },

    /// A serializer or compressor name has no registered factory.
    #[error("no {kind} registered under '{name}'")]
    UnknownCodec {
        /// `serializer` or `compressor`.
        kind: &'static str,
        /// The name that was looked up.
        name: String,
    },
}

/// Top-level error for server and client entry points.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// `start` was called on a server that is already running.
    #[error("server already started")]
    AlreadyStarted,
}

/// Crate-level result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;
