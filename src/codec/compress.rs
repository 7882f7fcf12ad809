//! zstd compression pass applied to every structured payload.

use std::io::{self, Read};

use crate::error::DecodeError;

/// Default zstd level (fast, decent ratio).
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

/// Default upper bound on a decompressed payload (64 MiB).
pub const DEFAULT_MAX_DECOMPRESSED_SIZE: usize = 64 * 1024 * 1024;

/// Compress `data` into a single zstd frame.
#[inline]
pub fn compress(data: &[u8], level: i32) -> std::io::Result<Vec<u8>> {
    zstd::stream::encode_all(data, level)
}

/// Decompress a zstd frame, producing at most `limit` bytes.
///
/// Output is read incrementally, so a small frame that expands past the
/// limit is rejected without allocating the full expansion.
///
/// # Errors
///
/// [`DecodeError::Decompress`] for truncated or corrupt input, or when the
/// output would exceed `limit`.
pub fn decompress(data: &[u8], limit: usize) -> Result<Vec<u8>, DecodeError> {
    let decoder = zstd::stream::read::Decoder::new(data).map_err(DecodeError::Decompress)?;

    let mut output = Vec::new();
    decoder
        .take((limit as u64).saturating_add(1))
        .read_to_end(&mut output)
        .map_err(DecodeError::Decompress)?;

    if output.len() > limit {
        return Err(DecodeError::Decompress(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("decompressed payload exceeds {limit} bytes"),
        )));
    }
    Ok(output)
}
