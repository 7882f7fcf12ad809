//! Structured text formats.
//!
//! MsgPack is always written with `to_vec_named` so structs become maps
//! keyed by field name, the same shape JSON produces. The positional array
//! form would not survive a loose decode on the server side.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{DecodeError, Result};

/// Structured format of the payload before compression.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Format {
    /// UTF-8 JSON text.
    #[default]
    Json,
    /// MessagePack with named fields.
    MsgPack,
}

impl Format {
    pub fn serialize<T: Serialize>(self, value: &T) -> Result<Vec<u8>> {
        match self {
            Format::Json => Ok(serde_json::to_vec(value)?),
            Format::MsgPack => Ok(rmp_serde::to_vec_named(value)?),
        }
    }

    pub fn deserialize<T: DeserializeOwned>(self, bytes: &[u8]) -> std::result::Result<T, DecodeError> {
        match self {
            Format::Json => Ok(serde_json::from_slice(bytes)?),
            Format::MsgPack => Ok(rmp_serde::from_slice(bytes)?),
        }
    }
}
