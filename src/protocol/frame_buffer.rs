//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` so complete payloads are split off without copying.
//! Parsing is a two-state machine:
//! - `WaitingForHeader`: need at least 4 bytes
//! - `WaitingForPayload`: header parsed, need N more payload bytes

use bytes::{Bytes, BytesMut};

use super::frame::{decode_header, DEFAULT_MAX_FRAME_SIZE, HEADER_SIZE};
use crate::error::{KorvError, Result};

#[derive(Debug, Clone, Copy)]
enum State {
    WaitingForHeader,
    WaitingForPayload { remaining: usize },
}

/// Buffer turning an arbitrary chunked byte stream into complete payloads.
pub struct FrameBuffer {
    buffer: BytesMut,
    state: State,
    max_frame_size: u32,
}

impl FrameBuffer {
    /// New buffer with a 64KB initial capacity and the default size limit.
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForHeader,
            max_frame_size,
        }
    }

    /// Push data into the buffer and extract every payload it completes.
    ///
    /// Partial data stays buffered for the next push.
    ///
    /// # Errors
    ///
    /// Returns [`KorvError::Protocol`] if a header announces a payload larger
    /// than the limit. The stream cannot be resynchronised after that.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Bytes>> {
        self.buffer.extend_from_slice(data);

        let mut payloads = Vec::new();
        while let Some(payload) = self.try_extract_one()? {
            payloads.push(payload);
        }
        Ok(payloads)
    }

    fn try_extract_one(&mut self) -> Result<Option<Bytes>> {
        loop {
            match self.state {
                State::WaitingForHeader => {
                    let Some(len) = decode_header(&self.buffer) else {
                        return Ok(None);
                    };

                    if len > self.max_frame_size {
                        return Err(KorvError::Protocol(format!(
                            "Frame size {} exceeds maximum {}",
                            len, self.max_frame_size
                        )));
                    }

                    let _ = self.buffer.split_to(HEADER_SIZE);
                    self.state = State::WaitingForPayload {
                        remaining: len as usize,
                    };
                }
                State::WaitingForPayload { remaining } => {
                    if self.buffer.len() < remaining {
                        return Ok(None);
                    }

                    let payload = self.buffer.split_to(remaining).freeze();
                    self.state = State::WaitingForHeader;
                    return Ok(Some(payload));
                }
            }
        }
    }

    /// Number of buffered, not yet consumed bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Drop buffered data and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForHeader;
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match self.state {
            State::WaitingForHeader => "WaitingForHeader",
            State::WaitingForPayload { .. } => "WaitingForPayload",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
