//! Structural validation of inbound requests.
//!
//! The checks run in a fixed order and stop at the first failure, so a
//! malformed request is answered by exactly one `400`.

use serde_json::Value;

use crate::error::ValidationError;
use crate::protocol::{MessageId, Request, Verb};

/// Turn a loosely decoded message into a [`Request`].
///
/// Order of checks:
/// 1. the message is a map
/// 2. `id` is present and a number or a string
/// 3. `verb` is present and one of `GET | STORE | UPDATE | DELETE`
/// 4. `resource` is present and a non-empty string
/// 5. `STORE` / `UPDATE` carry a non-null `body`
/// 6. a non-null `body` is a map
///
/// Failures before the id is known carry [`MessageId::UNKNOWN`].
pub fn validate(message: &Value) -> Result<Request, ValidationError> {
    let Some(fields) = message.as_object() else {
        return Err(ValidationError::new(
            MessageId::UNKNOWN,
            "Request must be a map",
        ));
    };

    let id = match fields.get("id") {
        None => return Err(ValidationError::new(MessageId::UNKNOWN, "Missing 'id'")),
        Some(raw) => MessageId::from_value(raw)
            .ok_or_else(|| ValidationError::new(MessageId::UNKNOWN, "Invalid 'id'"))?,
    };
    let reject = |reason: String| ValidationError::new(id.clone(), reason);

    let verb = match fields.get("verb") {
        None => return Err(reject("Missing 'verb'".into())),
        Some(Value::String(name)) => name
            .parse::<Verb>()
            .map_err(|_| reject(format!("Unknown verb '{name}'")))?,
        Some(_) => return Err(reject("Invalid 'verb'".into())),
    };

    let resource = match fields.get("resource") {
        None => return Err(reject("Missing 'resource'".into())),
        Some(Value::String(resource)) if resource.is_empty() => {
            return Err(reject("Empty 'resource'".into()))
        }
        Some(Value::String(resource)) => resource.clone(),
        Some(_) => return Err(reject("Invalid 'resource'".into())),
    };

    let body = fields.get("body").filter(|body| !body.is_null()).cloned();
    if verb.requires_body() && body.is_none() {
        return Err(reject("Missing 'body'".into()));
    }
    if body.as_ref().is_some_and(|body| !body.is_object()) {
        return Err(reject("Invalid 'body': expected a map".into()));
    }

    Ok(Request {
        id,
        verb,
        resource,
        body,
    })
}
