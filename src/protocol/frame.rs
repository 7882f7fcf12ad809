//! Length-prefixed framing.
//!
//! Every encoded message travels as one frame:
//!
//! ```text
//! ┌──────────────┬────────────────────┐
//! │ Length       │ Payload            │
//! │ 4 bytes      │ `Length` bytes     │
//! │ uint32 BE    │ compressed message │
//! └──────────────┴────────────────────┘
//! ```
//!
//! The channel is a plain byte stream, so the prefix is what restores
//! message boundaries on the receiving side.

use crate::error::{KorvError, Result};

/// Frame header size in bytes.
pub const HEADER_SIZE: usize = 4;

/// Default maximum payload size (16 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Encode the header for a payload of `len` bytes.
#[inline]
pub fn encode_header(len: u32) -> [u8; HEADER_SIZE] {
    len.to_be_bytes()
}

/// Decode a header. Returns `None` if fewer than [`HEADER_SIZE`] bytes are given.
#[inline]
pub fn decode_header(buf: &[u8]) -> Option<u32> {
    let bytes: [u8; HEADER_SIZE] = buf.get(..HEADER_SIZE)?.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

/// Payload length as a header value, rejecting payloads that do not fit.
pub fn payload_len(payload: &[u8], max_frame_size: u32) -> Result<u32> {
    match u32::try_from(payload.len()) {
        Ok(len) if len <= max_frame_size => Ok(len),
        _ => Err(KorvError::Protocol(format!(
            "Payload size {} exceeds maximum {}",
            payload.len(),
            max_frame_size
        ))),
    }
}

/// Build a complete frame (header + payload) in one buffer.
pub fn build_frame(payload: &[u8]) -> Result<Vec<u8>> {
    let len = payload_len(payload, u32::MAX)?;
    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.extend_from_slice(&encode_header(len));
    frame.extend_from_slice(payload);
    Ok(frame)
}
