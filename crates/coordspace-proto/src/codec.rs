//! Binary codec
//!
//! bincode with fixed-width integers, a size limit and trailing-byte
//! rejection. A [`Codec`] reuses one output buffer, so it takes `&mut self`
//! for anything that encodes; give each task its own codec instead of
//! sharing one.

use bincode::Options;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Largest frame the codec will produce or accept
pub const MAX_FRAME_SIZE: u64 = 64 * 1024 * 1024;

pub type SerializationResult<T> = Result<T, SerializationError>;

/// Codec failure; fatal to the operation that hit it
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("encode error: {0}")]
    Encode(bincode::Error),

    #[error("decode error: {0}")]
    Decode(bincode::Error),
}

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_FRAME_SIZE)
        .with_fixint_encoding()
        .reject_trailing_bytes()
}

/// Encode a value into a fresh buffer
pub fn encode<T: Serialize + ?Sized>(value: &T) -> SerializationResult<Vec<u8>> {
    options().serialize(value).map_err(SerializationError::Encode)
}

/// Decode a value
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> SerializationResult<T> {
    options().deserialize(bytes).map_err(SerializationError::Decode)
}

/// Codec with a reusable output buffer
#[derive(Debug, Default)]
pub struct Codec {
    buf: Vec<u8>,
}

impl Codec {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn fill<T: Serialize + ?Sized>(&mut self, value: &T) -> SerializationResult<()> {
        self.buf.clear();
        options()
            .serialize_into(&mut self.buf, value)
            .map_err(SerializationError::Encode)
    }

    /// Encode a value
    pub fn serialize<T: Serialize + ?Sized>(&mut self, value: &T) -> SerializationResult<Vec<u8>> {
        self.fill(value)?;
        Ok(self.buf.clone())
    }

    /// Decode a value
    pub fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> SerializationResult<T> {
        decode(bytes)
    }

    /// Deep copy through the wire format: `deserialize(serialize(value))`
    ///
    /// The result never shares state with `value`.
    pub fn copy<T: Serialize + DeserializeOwned>(&mut self, value: &T) -> SerializationResult<T> {
        self.fill(value)?;
        decode(&self.buf)
    }
}
