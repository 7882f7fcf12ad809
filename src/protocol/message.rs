//! Protocol messages: [`Request`], [`Response`] and their building blocks.
//!
//! Wire shape (field names are fixed):
//!
//! ```text
//! Request  { id: number|string, verb: string, resource: string, body: object|null }
//! Response { id: number|string, request_id: number|string, code: integer, body: object|null }
//! ```

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::KorvError;

/// Protocol operation kind. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verb {
    Get,
    Store,
    Update,
    Delete,
}

impl Verb {
    /// Every verb, in wire order.
    pub const ALL: [Verb; 4] = [Verb::Get, Verb::Store, Verb::Update, Verb::Delete];

    /// Wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Get => "GET",
            Verb::Store => "STORE",
            Verb::Update => "UPDATE",
            Verb::Delete => "DELETE",
        }
    }

    /// `STORE` and `UPDATE` must carry a non-null body.
    #[inline]
    pub fn requires_body(self) -> bool {
        matches!(self, Verb::Store | Verb::Update)
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verb {
    type Err = KorvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Verb::ALL
            .into_iter()
            .find(|verb| verb.as_str() == s)
            .ok_or_else(|| KorvError::UnknownVerb(s.to_string()))
    }
}

/// Message identifier as it appears on the wire: a number or a string.
///
/// Any JSON number is accepted. Variant order matters for untagged
/// decoding: unsigned, then signed, then fractional.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageId {
    Number(u64),
    Signed(i64),
    Float(FloatId),
    Text(String),
}

/// Fractional id. Compared and hashed by bit pattern so it can key the
/// pending-request table.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FloatId(pub f64);

impl PartialEq for FloatId {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Eq for FloatId {}

impl std::hash::Hash for FloatId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

impl MessageId {
    /// `request_id` used when the originating request could not be determined.
    pub const UNKNOWN: MessageId = MessageId::Number(0);

    /// Interpret a loosely decoded value as an id.
    ///
    /// Accepts numbers and strings, nothing else.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n
                .as_u64()
                .map(MessageId::Number)
                .or_else(|| n.as_i64().map(MessageId::Signed))
                .or_else(|| n.as_f64().map(|f| MessageId::Float(FloatId(f)))),
            Value::String(s) => Some(MessageId::Text(s.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Number(n) => write!(f, "{n}"),
            MessageId::Signed(n) => write!(f, "{n}"),
            MessageId::Float(FloatId(n)) => write!(f, "{n}"),
            MessageId::Text(s) => f.write_str(s),
        }
    }
}

impl From<u64> for MessageId {
    fn from(n: u64) -> Self {
        MessageId::Number(n)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        MessageId::Text(s.to_string())
    }
}

/// Monotonic id source. Starts at 1 so that ids never collide with
/// [`MessageId::UNKNOWN`].
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Allocate the next id. Safe to call from any thread.
    #[inline]
    pub fn next_id(&self) -> MessageId {
        MessageId::Number(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Response status code with HTTP-like meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Status(pub u16);

impl Status {
    pub const OK: Status = Status(200);
    pub const BAD_REQUEST: Status = Status(400);
    pub const NOT_FOUND: Status = Status(404);
    pub const INTERNAL_ERROR: Status = Status(500);

    #[inline]
    pub fn as_u16(self) -> u16 {
        self.0
    }

    /// 2xx codes.
    #[inline]
    pub fn is_success(self) -> bool {
        (200..300).contains(&self.0)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for Status {
    fn from(code: u16) -> Self {
        Status(code)
    }
}

/// A validated request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: MessageId,
    pub verb: Verb,
    pub resource: String,
    #[serde(default)]
    pub body: Option<Value>,
}

impl Request {
    pub fn new(id: MessageId, verb: Verb, resource: impl Into<String>, body: Option<Value>) -> Self {
        Self {
            id,
            verb,
            resource: resource.into(),
            body,
        }
    }
}

/// A response to a single request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: MessageId,
    pub request_id: MessageId,
    pub code: Status,
    #[serde(default)]
    pub body: Option<Value>,
}

impl Response {
    pub fn new(id: MessageId, request_id: MessageId, code: Status, body: Option<Value>) -> Self {
        Self {
            id,
            request_id,
            code,
            body,
        }
    }

    /// Response whose body is `{"message": ...}`.
    pub fn with_message(
        id: MessageId,
        request_id: MessageId,
        code: Status,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            id,
            request_id,
            code,
            Some(json!({ "message": message.into() })),
        )
    }

    /// The `message` field of the body, if any.
    pub fn message(&self) -> Option<&str> {
        self.body.as_ref()?.get("message")?.as_str()
    }
}
