//! Handler module - server-side validation and dispatch.
//!
//! Provides:
//! - [`validate`] - structural checks on an inbound request
//! - [`Router`] - maps `(verb, resource)` to an ordered list of handlers
//! - [`Reply`] - what a handler returns
//!
//! # Example
//!
//! ```
//! use korv::handler::{Reply, Router};
//! use korv::protocol::{MessageId, Request, Status, Verb};
//! use serde_json::json;
//!
//! let router = Router::new();
//! router.register(Verb::Get, "/hello", |_request| {
//!     Ok(Reply::ok(json!({"msg": "Hello World!"})))
//! });
//!
//! let request = Request::new(MessageId::Number(1), Verb::Get, "/hello", None);
//! let responses = router.dispatch(&request);
//! assert_eq!(responses[0].code, Status::OK);
//! ```

mod reply;
mod router;
mod validator;

pub use reply::Reply;
pub use router::{Handler, HandlerResult, Route, Router, TypedHandler};
pub use validator::validate;
