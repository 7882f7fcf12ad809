//! Transport module - the byte channel underneath a session.
//!
//! korv never authenticates or encrypts: any reliable, ordered duplex stream
//! will do. This module provides the plain ones:
//! - TCP
//! - Unix Domain Sockets (Unix only)
//!
//! Secure channels (an SSH direct-tcpip channel, a TLS stream, ...) are set
//! up by the caller and handed to
//! [`Server::serve_connection`](crate::Server::serve_connection) or
//! [`ClientBuilder::attach`](crate::ClientBuilder::attach) as any
//! `AsyncRead + AsyncWrite` value.

mod endpoint;
mod stream;

pub use endpoint::{Endpoint, DEFAULT_PORT};
pub use stream::{connect, Connection, Listener};
