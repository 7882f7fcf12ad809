use serde_json::Value;

use crate::protocol::Status;

/// Status code plus optional body returned by a handler.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub code: Status,
    pub body: Option<Value>,
}

impl Reply {
    pub fn new(code: impl Into<Status>, body: Option<Value>) -> Self {
        Self {
            code: code.into(),
            body,
        }
    }

    /// `200` with a body.
    pub fn ok(body: Value) -> Self {
        Self::new(Status::OK, Some(body))
    }

    /// Bare status, no body.
    pub fn status(code: impl Into<Status>) -> Self {
        Self::new(code, None)
    }
}

impl From<(u16, Value)> for Reply {
    fn from((code, body): (u16, Value)) -> Self {
        Self::new(code, Some(body))
    }
}

impl From<Status> for Reply {
    fn from(code: Status) -> Self {
        Self::status(code)
    }
}
