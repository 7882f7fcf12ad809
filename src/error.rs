//! Error types for korv.

use thiserror::Error;

use crate::protocol::MessageId;

/// Main error type for all korv operations.
#[derive(Debug, Error)]
pub enum KorvError {
    /// I/O error on the channel or during compression.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON encode error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// Inbound bytes could not be turned back into a message.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Framing violation (oversized frame, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Verb outside `GET | STORE | UPDATE | DELETE`.
    #[error("Unknown verb: {0}")]
    UnknownVerb(String),

    /// A request with this id is already awaiting a response.
    #[error("Duplicate request id: {0}")]
    DuplicateId(MessageId),

    /// No pending entry exists for this id.
    #[error("Unknown request id: {0}")]
    UnknownRequest(MessageId),

    /// The request was abandoned after waiting too long.
    #[error("Request {0} timed out")]
    Timeout(MessageId),

    /// The request was cancelled locally.
    #[error("Request {0} was cancelled")]
    Cancelled(MessageId),

    /// Connection closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Backpressure timeout - write buffer full.
    #[error("Backpressure timeout")]
    BackpressureTimeout,

    /// Endpoint string could not be parsed.
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

/// Failure to decode an inbound payload.
///
/// These never tear a session down: the payload is logged and dropped.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The compressed envelope is truncated or corrupt.
    #[error("decompression failed: {0}")]
    Decompress(#[source] std::io::Error),

    /// Decompressed bytes are not valid JSON for the expected shape.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Decompressed bytes are not valid MsgPack for the expected shape.
    #[error("invalid MsgPack: {0}")]
    MsgPack(#[from] rmp_serde::decode::Error),
}

/// A structurally malformed request, answered with a single `400`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct ValidationError {
    /// Echoed id, or [`MessageId::UNKNOWN`] when the id itself is unusable.
    pub request_id: MessageId,
    /// Human readable reason, sent back as the `message` field.
    pub reason: String,
}

impl ValidationError {
    pub(crate) fn new(request_id: MessageId, reason: impl Into<String>) -> Self {
        Self {
            request_id,
            reason: reason.into(),
        }
    }
}

/// Result type alias using KorvError.
pub type Result<T> = std::result::Result<T, KorvError>;
