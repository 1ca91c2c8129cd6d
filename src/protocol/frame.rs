//! Length-delimited frame codec with magic-byte resynchronization.

use super::codec::{CodecRegistry, Compressor, IdentityCompressor, RawSerializer, Serializer};
use super::{attachment, Codec, Message};
use crate::config::Config;
use crate::error::{ConfigError, ProtocolError};
use crate::runtime::ReadBuffer;
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::Arc;
use tracing::trace;

/// Frame start sentinel.
pub const MAGIC: u8 = 0xA7;

/// Protocol version written by default.
pub const VERSION: u8 = 1;

/// magic + version + two 32-bit lengths.
pub const HEADER_LEN: usize = 10;

/// Resynchronizing length-delimited codec.
///
/// The version byte is carried but not validated on decode.
#[derive(Clone)]
pub struct FrameCodec {
    max_content_length: usize,
    version: u8,
    serializer: Arc<dyn Serializer>,
    compressor: Arc<dyn Compressor>,
}

impl FrameCodec {
    /// Codec with raw payloads and no compression.
    pub fn new(max_content_length: usize) -> Self {
        Self {
            max_content_length,
            version: VERSION,
            serializer: Arc::new(RawSerializer),
            compressor: Arc::new(IdentityCompressor),
        }
    }

    /// Resolve serializer and compressor names from `config` in `registry`.
    pub fn from_config(config: &Config, registry: &CodecRegistry) -> Result<Self, ConfigError> {
        Ok(Self {
            max_content_length: config.max_content_length,
            version: VERSION,
            serializer: registry.serializer(&config.serializer)?,
            compressor: registry.compressor(&config.compressor)?,
        })
    }

    pub fn with_version(mut self, version: u8) -> Self {
        self.version = version;
        self
    }

    pub fn with_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn with_compressor(mut self, compressor: Arc<dyn Compressor>) -> Self {
        self.compressor = compressor;
        self
    }

    pub fn max_content_length(&self) -> usize {
        self.max_content_length
    }

    /// Encode into a fresh buffer.
    pub fn encode_to_bytes(&self, message: &Message) -> Result<Bytes, ProtocolError> {
        let mut dst = BytesMut::new();
        self.encode(message, &mut dst)?;
        Ok(dst.freeze())
    }

    fn check_length(&self, size: usize) -> Result<(), ProtocolError> {
        if size > self.max_content_length {
            return Err(ProtocolError::FrameTooLarge {
                size,
                max: self.max_content_length,
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for FrameCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameCodec")
            .field("max_content_length", &self.max_content_length)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

fn read_length(bytes: &[u8], field: &'static str) -> Result<usize, ProtocolError> {
    let value = i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    usize::try_from(value).map_err(|_| ProtocolError::InvalidLength { field, value })
}

impl Codec for FrameCodec {
    fn decode(&self, src: &mut ReadBuffer) -> Result<Option<Message>, ProtocolError> {
        loop {
            let buf = src.peek();
            if buf.len() < HEADER_LEN {
                return Ok(None);
            }

            if buf[0] != MAGIC {
                // Drop everything up to the next candidate frame start
                let skip = buf[1..]
                    .iter()
                    .position(|&b| b == MAGIC)
                    .map_or(buf.len(), |pos| pos + 1);
                trace!(skip, "Resynchronizing on magic byte");
                src.advance(skip);
                continue;
            }

            let attachment_len = read_length(&buf[2..6], "attachment")?;
            let payload_len = read_length(&buf[6..10], "payload")?;
            let content_len = attachment_len + payload_len;
            self.check_length(content_len)?;

            if buf.len() - HEADER_LEN < content_len {
                return Ok(None);
            }

            let body = &buf[HEADER_LEN..HEADER_LEN + content_len];
            let headers = attachment::decode(&body[..attachment_len]);
            let raw_payload = Bytes::copy_from_slice(&body[attachment_len..]);
            src.advance(HEADER_LEN + content_len);

            let headers = headers?;
            let payload = self
                .serializer
                .deserialize(self.compressor.decompress(raw_payload)?)?;
            trace!(attachment_len, payload_len, "Decoded frame");
            return Ok(Some(Message::with_headers(headers, payload)));
        }
    }

    fn encode(&self, message: &Message, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let attachment = attachment::encode(message.headers());
        let payload = self
            .compressor
            .compress(&self.serializer.serialize(message.payload())?)?;
        self.check_length(attachment.len() + payload.len())?;

        dst.reserve(HEADER_LEN + attachment.len() + payload.len());
        dst.put_u8(MAGIC);
        dst.put_u8(self.version);
        dst.put_i32(attachment.len() as i32);
        dst.put_i32(payload.len() as i32);
        dst.extend_from_slice(&attachment);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Chunk;

    fn buffer(capacity: usize) -> ReadBuffer {
        ReadBuffer::new(Chunk::unpooled(capacity))
    }

    fn sample() -> Message {
        Message::new("hello").header("k", "v")
    }

    /// Feed `bytes` in pieces of `step`, draining decoded messages after each.
    fn feed(codec: &FrameCodec, bytes: &[u8], step: usize) -> Vec<Message> {
        let mut buf = buffer(4096);
        let mut out = Vec::new();
        for piece in bytes.chunks(step) {
            assert_eq!(buf.extend_from_slice(piece), piece.len());
            while let Some(msg) = codec.decode(&mut buf).unwrap() {
                out.push(msg);
            }
        }
        out
    }

    #[test]
    fn test_wire_layout() {
        let codec = FrameCodec::new(1024);
        let bytes = codec.encode_to_bytes(&sample()).unwrap();
        assert_eq!(
            &bytes[..],
            &[0xA7, 1, 0, 0, 0, 3, 0, 0, 0, 5, b'k', b'=', b'v', b'h', b'e', b'l', b'l', b'o'][..]
        );
    }

    #[test]
    fn test_roundtrip() {
        let codec = FrameCodec::new(1024);
        let bytes = codec.encode_to_bytes(&sample()).unwrap();
        let mut buf = buffer(256);
        buf.extend_from_slice(&bytes);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(sample()));
        assert!(buf.is_empty());
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_byte_at_a_time() {
        let codec = FrameCodec::new(1024);
        let bytes = codec.encode_to_bytes(&sample()).unwrap();
        let mut buf = buffer(256);

        for (i, byte) in bytes.iter().enumerate() {
            buf.extend_from_slice(&[*byte]);
            let decoded = codec.decode(&mut buf).unwrap();
            if i + 1 < bytes.len() {
                assert!(decoded.is_none(), "decoded early at byte {i}");
                // Partial frames are never consumed
                assert_eq!(buf.len(), i + 1);
            } else {
                assert_eq!(decoded, Some(sample()));
            }
        }
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_many_frames_any_split() {
        let codec = FrameCodec::new(1024);
        let messages: Vec<Message> = (0..20)
            .map(|i| {
                Message::new(vec![i as u8; i * 7])
                    .header("seq", i.to_string())
                    .header("kind", if i % 2 == 0 { "even" } else { "odd" })
            })
            .collect();

        let mut stream = BytesMut::new();
        for msg in &messages {
            codec.encode(msg, &mut stream).unwrap();
        }

        for step in [1, 2, 3, 7, 10, 64, 333, stream.len()] {
            assert_eq!(feed(&codec, &stream, step), messages, "split size {step}");
        }
    }

    #[test]
    fn test_resync_after_garbage() {
        let codec = FrameCodec::new(1024);
        let mut stream = BytesMut::from(&b"\x00\x01garbage\xffbytes-here"[..]);
        codec.encode(&sample(), &mut stream).unwrap();

        assert_eq!(feed(&codec, &stream, 1), vec![sample()]);
        assert_eq!(feed(&codec, &stream, stream.len()), vec![sample()]);
    }

    #[test]
    fn test_short_garbage_is_consumed() {
        let codec = FrameCodec::new(1024);
        let mut buf = buffer(64);
        buf.extend_from_slice(b"0123456789ab");
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert!(buf.is_empty());

        // A lone magic byte after garbage is kept as a frame start candidate
        buf.extend_from_slice(b"0123456789\xA7\x01");
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(buf.peek(), b"\xA7\x01");
    }

    #[test]
    fn test_oversized_frame_rejected_on_decode() {
        let big = FrameCodec::new(4096);
        let bytes = big
            .encode_to_bytes(&Message::new(vec![0u8; 2048]))
            .unwrap();

        let codec = FrameCodec::new(1024);
        let mut buf = buffer(4096);
        // Header alone is enough to reject
        buf.extend_from_slice(&bytes[..HEADER_LEN]);
        match codec.decode(&mut buf) {
            Err(ProtocolError::FrameTooLarge { size, max }) => {
                assert_eq!(size, 2048);
                assert_eq!(max, 1024);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_oversized_frame_rejected_on_encode() {
        let codec = FrameCodec::new(1024);
        let mut dst = BytesMut::new();
        let err = codec
            .encode(&Message::new(vec![0u8; 2048]), &mut dst)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { size: 2048, .. }));
        assert!(dst.is_empty());
    }

    #[test]
    fn test_negative_length() {
        let codec = FrameCodec::new(1024);
        let mut buf = buffer(64);
        buf.extend_from_slice(&[MAGIC, 1, 0xff, 0xff, 0xff, 0xff, 0, 0, 0, 0]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::InvalidLength {
                field: "attachment",
                value: -1
            })
        ));
    }

    #[test]
    fn test_version_not_validated() {
        let writer = FrameCodec::new(1024).with_version(9);
        let bytes = writer.encode_to_bytes(&sample()).unwrap();
        assert_eq!(bytes[1], 9);

        let mut buf = buffer(256);
        buf.extend_from_slice(&bytes);
        assert_eq!(FrameCodec::new(1024).decode(&mut buf).unwrap(), Some(sample()));
    }

    /// Reverses payload bytes; stands in for a real compressor.
    struct Reverse;

    impl Compressor for Reverse {
        fn compress(&self, bytes: &[u8]) -> Result<Bytes, ProtocolError> {
            Ok(bytes.iter().rev().copied().collect::<Vec<_>>().into())
        }

        fn decompress(&self, bytes: Bytes) -> Result<Bytes, ProtocolError> {
            self.compress(&bytes)
        }
    }

    #[test]
    fn test_registered_compressor() {
        let mut registry = CodecRegistry::default();
        registry.register_compressor("reverse", || Arc::new(Reverse));
        let config = Config {
            compressor: "reverse".to_string(),
            ..Config::default()
        };
        let codec = FrameCodec::from_config(&config, &registry).unwrap();

        let bytes = codec.encode_to_bytes(&sample()).unwrap();
        assert_eq!(&bytes[bytes.len() - 5..], b"olleh");

        let mut buf = buffer(256);
        buf.extend_from_slice(&bytes);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(sample()));
    }

    #[test]
    fn test_unknown_codec_name() {
        let config = Config {
            serializer: "protobuf".to_string(),
            ..Config::default()
        };
        assert!(matches!(
            FrameCodec::from_config(&config, &CodecRegistry::default()),
            Err(ConfigError::UnknownCodec { kind: "serializer", .. })
        ));
    }
}
