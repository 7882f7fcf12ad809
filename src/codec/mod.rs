//! Codec module - message <-> bytes.
//!
//! Encoding is two steps, reversed on decode:
//!
//! 1. serialize to a structured map-with-string-keys form ([`Format`])
//! 2. compress the result ([`compress`])
//!
//! # Example
//!
//! ```
//! use korv::codec::Codec;
//! use korv::protocol::{MessageId, Request, Verb};
//!
//! let codec = Codec::default();
//! let request = Request::new(MessageId::Number(1), Verb::Get, "/hello", None);
//!
//! let bytes = codec.encode(&request).unwrap();
//! let decoded: Request = codec.decode(&bytes).unwrap();
//! assert_eq!(decoded, request);
//! ```

mod compress;
mod format;

pub use compress::{compress, decompress, DEFAULT_COMPRESSION_LEVEL, DEFAULT_MAX_DECOMPRESSED_SIZE};
pub use format::Format;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{DecodeError, Result};

/// Codec settings. Both peers of a channel must use the same settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecConfig {
    /// Structured format.
    pub format: Format,
    /// zstd level, or `None` to send the structured bytes uncompressed.
    pub compression_level: Option<i32>,
    /// Largest payload a compressed frame may expand to on decode.
    pub max_decompressed_size: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            format: Format::Json,
            compression_level: Some(DEFAULT_COMPRESSION_LEVEL),
            max_decompressed_size: DEFAULT_MAX_DECOMPRESSED_SIZE,
        }
    }
}

/// Symmetric message codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct Codec {
    config: CodecConfig,
}

impl Codec {
    pub fn new(config: CodecConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> CodecConfig {
        self.config
    }

    /// Serialize and compress a message.
    pub fn encode<T: Serialize>(&self, message: &T) -> Result<Vec<u8>> {
        let structured = self.config.format.serialize(message)?;
        match self.config.compression_level {
            Some(level) => Ok(compress(&structured, level)?),
            None => Ok(structured),
        }
    }

    /// Decompress and deserialize a message.
    ///
    /// Truncated or corrupt input is reported as a [`DecodeError`], never a panic.
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> std::result::Result<T, DecodeError> {
        match self.config.compression_level {
            Some(_) => {
                let structured = decompress(bytes, self.config.max_decompressed_size)?;
                self.config.format.deserialize(&structured)
            }
            None => self.config.format.deserialize(bytes),
        }
    }
}
