//! Payload serializers, compressors and the registry that resolves them.
//!
//! Implementations are looked up by name from the configuration at
//! startup. The registry is an ordinary value owned by whoever builds the
//! codec; there is no global state.

use crate::error::{ConfigError, ProtocolError};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;

/// Converts payloads to and from their wire representation.
pub trait Serializer: Send + Sync {
    fn serialize(&self, payload: &[u8]) -> Result<Bytes, ProtocolError>;
    fn deserialize(&self, bytes: Bytes) -> Result<Bytes, ProtocolError>;
}

/// Optional payload compression applied after serialization.
pub trait Compressor: Send + Sync {
    fn compress(&self, bytes: &[u8]) -> Result<Bytes, ProtocolError>;
    fn decompress(&self, bytes: Bytes) -> Result<Bytes, ProtocolError>;
}

/// Pass-through serializer (`"raw"`).
#[derive(Debug, Clone, Copy, Default)]
pub struct RawSerializer;

impl Serializer for RawSerializer {
    fn serialize(&self, payload: &[u8]) -> Result<Bytes, ProtocolError> {
        Ok(Bytes::copy_from_slice(payload))
    }

    fn deserialize(&self, bytes: Bytes) -> Result<Bytes, ProtocolError> {
        Ok(bytes)
    }
}

/// Pass-through compressor (`"identity"`).
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityCompressor;

impl Compressor for IdentityCompressor {
    fn compress(&self, bytes: &[u8]) -> Result<Bytes, ProtocolError> {
        Ok(Bytes::copy_from_slice(bytes))
    }

    fn decompress(&self, bytes: Bytes) -> Result<Bytes, ProtocolError> {
        Ok(bytes)
    }
}

type SerializerFactory = Box<dyn Fn() -> Arc<dyn Serializer> + Send + Sync>;
type CompressorFactory = Box<dyn Fn() -> Arc<dyn Compressor> + Send + Sync>;

/// Name-to-factory registry for payload codecs.
///
/// `CodecRegistry::default()` knows `"raw"` and `"identity"`.
pub struct CodecRegistry {
    serializers: HashMap<String, SerializerFactory>,
    compressors: HashMap<String, CompressorFactory>,
}

impl Default for CodecRegistry {
    fn default() -> Self {
        let mut registry = Self {
            serializers: HashMap::new(),
            compressors: HashMap::new(),
        };
        registry.register_serializer("raw", || Arc::new(RawSerializer));
        registry.register_compressor("identity", || Arc::new(IdentityCompressor));
        registry
    }
}

impl CodecRegistry {
    /// Register (or replace) a serializer factory.
    pub fn register_serializer<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn Serializer> + Send + Sync + 'static,
    {
        self.serializers.insert(name.into(), Box::new(factory));
    }

    /// Register (or replace) a compressor factory.
    pub fn register_compressor<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn Compressor> + Send + Sync + 'static,
    {
        self.compressors.insert(name.into(), Box::new(factory));
    }

    pub fn serializer(&self, name: &str) -> Result<Arc<dyn Serializer>, ConfigError> {
        self.serializers
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| ConfigError::UnknownCodec {
                kind: "serializer",
                name: name.to_string(),
            })
    }

    pub fn compressor(&self, name: &str) -> Result<Arc<dyn Compressor>, ConfigError> {
        self.compressors
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| ConfigError::UnknownCodec {
                kind: "compressor",
                name: name.to_string(),
            })
    }
}
