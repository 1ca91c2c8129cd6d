//! Wire protocol.
//!
//! Every frame on the wire is laid out as:
//!
//! ```text
//! byte    magic             0xA7
//! byte    version
//! int32   attachmentLength  (big-endian)
//! int32   payloadLength     (big-endian)
//! byte[attachmentLength]    attachment (key=value pairs)
//! byte[payloadLength]       payload (serialized, then compressed)
//! ```
//!
//! - `frame`: the resynchronizing [`FrameCodec`]
//! - `attachment`: header encoding for the attachment segment
//! - `codec`: pluggable payload [`Serializer`] and [`Compressor`] plus their registry

mod attachment;
mod codec;
mod frame;

pub use codec::{CodecRegistry, Compressor, IdentityCompressor, RawSerializer, Serializer};
pub use frame::{FrameCodec, HEADER_LEN, MAGIC, VERSION};

use crate::error::ProtocolError;
use crate::runtime::ReadBuffer;
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;

/// Header reserved for engine heartbeats.
pub const HEARTBEAT_HEADER: &str = "hb";

/// Turns byte streams into messages and back.
///
/// Sessions hold a shared codec; implementations must be stateless across
/// calls so one instance can serve every connection.
pub trait Codec: Send + Sync + 'static {
    /// Decode at most one message from `src`.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Bytes skipped while
    /// resynchronizing stay consumed.
    fn decode(&self, src: &mut ReadBuffer) -> Result<Option<Message>, ProtocolError>;

    /// Append the encoded form of `message` to `dst`.
    fn encode(&self, message: &Message, dst: &mut BytesMut) -> Result<(), ProtocolError>;
}

/// Ordered header list carried in the attachment segment.
///
/// Insertion order is preserved on the wire; keys are unique.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key`, replacing an existing value in place.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let pos = self.0.iter().position(|(k, _)| k == key)?;
        Some(self.0.remove(pos).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.insert(k, v);
        }
        headers
    }
}

/// A decoded protocol message.
///
/// Equality compares headers and payload only; peer addresses are
/// connection metadata.
#[derive(Debug, Clone, Default)]
pub struct Message {
    headers: Headers,
    payload: Bytes,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
}

impl Message {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            ..Self::default()
        }
    }

    pub fn with_headers(headers: Headers, payload: impl Into<Bytes>) -> Self {
        Self {
            headers,
            payload: payload.into(),
            ..Self::default()
        }
    }

    /// Builder-style header insertion.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key, value);
        self
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Local address of the connection this message arrived on.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Remote address of the connection this message arrived on.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub(crate) fn set_addrs(&mut self, local: Option<SocketAddr>, peer: Option<SocketAddr>) {
        self.local_addr = local;
        self.peer_addr = peer;
    }

    pub(crate) fn heartbeat(kind: &str) -> Self {
        Message::default().header(HEARTBEAT_HEADER, kind)
    }

    /// Heartbeat marker (`ping` / `pong`) if this is an engine heartbeat.
    pub(crate) fn heartbeat_kind(&self) -> Option<&str> {
        if self.payload.is_empty() && self.headers.len() == 1 {
            self.headers.get(HEARTBEAT_HEADER)
        } else {
            None
        }
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.headers == other.headers && self.payload == other.payload
    }
}

impl Eq for Message {}
