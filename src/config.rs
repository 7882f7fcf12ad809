//! Server and client configuration.
//!
//! Both are plain structs with a [`Default`]; the builders on
//! [`Server`](crate::Server) and [`Client`](crate::Client) fill them in.

use std::time::Duration;

use crate::codec::CodecConfig;
use crate::protocol::DEFAULT_MAX_FRAME_SIZE;
use crate::writer::WriterConfig;

/// Default number of handlers a server runs at once, across all sessions.
pub const DEFAULT_MAX_CONCURRENT_HANDLERS: usize = 256;

/// Default time a client waits for a response before abandoning it.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for a [`Server`](crate::Server).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Wire format and compression; must match the clients.
    pub codec: CodecConfig,
    /// Outbound queue tuning, per session.
    pub writer: WriterConfig,
    /// Largest accepted frame payload, in bytes.
    pub max_frame_size: u32,
    /// Upper bound on handlers running at the same time. 0 is treated as 1.
    pub max_concurrent_handlers: usize,
    /// Include a traceback in `500` bodies.
    ///
    /// On by default in debug builds only.
    pub diagnostics: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            codec: CodecConfig::default(),
            writer: WriterConfig::default(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_concurrent_handlers: DEFAULT_MAX_CONCURRENT_HANDLERS,
            diagnostics: cfg!(debug_assertions),
        }
    }
}

/// Configuration for a [`Client`](crate::Client).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Wire format and compression; must match the server.
    pub codec: CodecConfig,
    /// Outbound queue tuning.
    pub writer: WriterConfig,
    /// Largest accepted frame payload, in bytes.
    pub max_frame_size: u32,
    /// How long `request` and blocking `call` wait. `None` waits forever.
    pub request_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            codec: CodecConfig::default(),
            writer: WriterConfig::default(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            request_timeout: Some(DEFAULT_REQUEST_TIMEOUT),
        }
    }
}
