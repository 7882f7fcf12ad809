//! # korv
//!
//! Verb/resource request-response messaging over any reliable, ordered,
//! bidirectional byte channel.
//!
//! A client sends [`Request`]s (`GET | STORE | UPDATE | DELETE` on a
//! resource path, with an optional map body); the server validates each one,
//! dispatches it to the handlers registered for its `(verb, resource)` and
//! sends back one [`Response`] per handler. Responses carry the id of the
//! request they answer, so many requests can be in flight at once and
//! complete in any order.
//!
//! ## Architecture
//!
//! - **Codec**: JSON or MessagePack, then zstd ([`codec`])
//! - **Framing**: 4-byte big-endian length prefix ([`protocol`])
//! - **Server**: validator, router, blocking handler pool ([`handler`], [`Server`])
//! - **Client**: correlation table, async or blocking calls ([`correlation`], [`Client`])
//!
//! ## Example
//!
//! ```no_run
//! use korv::transport::{Endpoint, Listener};
//! use korv::{BlockingClient, Reply, Server, Verb};
//! use serde_json::json;
//!
//! # fn main() -> korv::Result<()> {
//! let endpoint: Endpoint = "tcp://127.0.0.1:8022".parse()?;
//!
//! let server = Server::builder()
//!     .route(Verb::Get, "/hello", |_request| {
//!         Ok(Reply::ok(json!({"msg": "Hello World!"})))
//!     })
//!     .build();
//! let runtime = tokio::runtime::Runtime::new()?;
//! let listener = runtime.block_on(Listener::bind(&endpoint))?;
//! runtime.spawn(async move { server.serve(listener).await });
//!
//! let client = BlockingClient::connect(&endpoint)?;
//! let response = client.get("/hello")?;
//! assert_eq!(response.body, Some(json!({"msg": "Hello World!"})));
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod correlation;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod transport;
pub mod writer;

mod client;
mod server;
mod session;

pub use client::{BlockingClient, Client, ClientBuilder};
pub use config::{ClientConfig, ServerConfig};
pub use error::{KorvError, Result};
pub use handler::{Reply, Router};
pub use protocol::{MessageId, Request, Response, Status, Verb};
pub use server::{Server, ServerBuilder};
pub use session::SessionState;
pub use transport::Endpoint;
