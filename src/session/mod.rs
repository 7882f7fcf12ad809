//! Session adapter - binds a byte channel to a codec and a dispatcher.
//!
//! Both sides share the same shape: a read pump turning channel bytes into
//! complete frame payloads, and a [writer task](crate::writer) owning the
//! write half. What happens to each payload differs:
//!
//! - [`server`]: decode, validate, dispatch, send the responses back
//! - [`client`]: decode, hand to the correlation table

pub(crate) mod client;
pub(crate) mod server;

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use bytes::Bytes;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::codec::Codec;
use crate::error::Result;
use crate::protocol::FrameBuffer;
use crate::writer::OutboundFrame;

/// Size of each read from the channel.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Channel handed over, pumps not running yet.
    Opening,
    /// Reading and writing.
    Established,
    /// End-of-input or a channel error; nothing more is sent or received.
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Opening => "opening",
            SessionState::Established => "established",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// A [`SessionState`] shared between the session task and its owner.
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new(state: SessionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn get(&self) -> SessionState {
        match self.0.load(Ordering::Acquire) {
            0 => SessionState::Opening,
            1 => SessionState::Established,
            _ => SessionState::Closed,
        }
    }

    pub(crate) fn set(&self, state: SessionState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Read pump: channel bytes in, complete frame payloads out.
pub(crate) struct FrameReader<R> {
    reader: R,
    frames: FrameBuffer,
    chunk: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub(crate) fn new(reader: R, max_frame_size: u32) -> Self {
        Self {
            reader,
            frames: FrameBuffer::with_max_frame_size(max_frame_size),
            chunk: vec![0u8; READ_BUFFER_SIZE],
        }
    }

    /// Wait for at least one complete payload.
    ///
    /// Returns `Ok(None)` at end-of-input. An oversized frame is an error:
    /// the stream cannot be resynchronised after it.
    pub(crate) async fn next_frames(&mut self) -> Result<Option<Vec<Bytes>>> {
        loop {
            let n = self.reader.read(&mut self.chunk).await?;
            if n == 0 {
                if !self.frames.is_empty() {
                    tracing::warn!(
                        "Channel closed with {} bytes of an incomplete frame",
                        self.frames.len()
                    );
                }
                return Ok(None);
            }

            let frames = self.frames.push(&self.chunk[..n])?;
            if !frames.is_empty() {
                tracing::debug!("Read {} bytes, {} complete frames", n, frames.len());
                return Ok(Some(frames));
            }
        }
    }
}

/// Encode a message and wrap it in a frame.
pub(crate) fn encode_frame<T: Serialize>(
    codec: &Codec,
    message: &T,
    max_frame_size: u32,
) -> Result<OutboundFrame> {
    let payload = codec.encode(message)?;
    OutboundFrame::new(Bytes::from(payload), max_frame_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KorvError;
    use crate::protocol::build_frame;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_state_cell() {
        let cell = StateCell::new(SessionState::Opening);
        assert_eq!(cell.get(), SessionState::Opening);
        cell.set(SessionState::Established);
        assert_eq!(cell.get(), SessionState::Established);
        cell.set(SessionState::Closed);
        assert_eq!(cell.get(), SessionState::Closed);
        assert_eq!(cell.get().to_string(), "closed");
    }

    #[tokio::test]
    async fn test_frame_reader_reassembles_split_frames() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(rx, 1024);

        let mut bytes = build_frame(b"first").unwrap();
        bytes.extend(build_frame(b"second").unwrap());

        tokio::spawn(async move {
            for piece in bytes.chunks(3) {
                tx.write_all(piece).await.unwrap();
                tx.flush().await.unwrap();
            }
        });

        let mut payloads = Vec::new();
        while let Some(frames) = reader.next_frames().await.unwrap() {
            payloads.extend(frames);
        }
        assert_eq!(payloads, vec![Bytes::from("first"), Bytes::from("second")]);
    }

    #[tokio::test]
    async fn test_frame_reader_rejects_oversized_frame() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(rx, 4);

        tx.write_all(&build_frame(b"too long").unwrap()).await.unwrap();
        assert!(matches!(
            reader.next_frames().await,
            Err(KorvError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_frame_reader_eof() {
        let (tx, rx) = tokio::io::duplex(64);
        drop(tx);
        let mut reader = FrameReader::new(rx, 1024);
        assert!(reader.next_frames().await.unwrap().is_none());
    }

    #[test]
    fn test_encode_frame_header_matches_payload() {
        let codec = Codec::default();
        let frame = encode_frame(&codec, &serde_json::json!({"a": 1}), 1024).unwrap();
        assert_eq!(
            u32::from_be_bytes(frame.header) as usize,
            frame.payload.len()
        );
    }
}
