//! Server builder and accept loop.
//!
//! # Example
//!
//! ```no_run
//! use korv::transport::{Endpoint, Listener};
//! use korv::{Reply, Server, Verb};
//! use serde_json::json;
//!
//! # async fn run() -> korv::Result<()> {
//! let server = Server::builder()
//!     .route(Verb::Get, "/hello", |_request| {
//!         Ok(Reply::ok(json!({"msg": "Hello World!"})))
//!     })
//!     .build();
//!
//! let listener = Listener::bind(&"tcp://127.0.0.1:8022".parse::<Endpoint>()?).await?;
//! server.serve(listener).await
//! # }
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::codec::CodecConfig;
use crate::config::ServerConfig;
use crate::error::Result;
use crate::handler::{Handler, HandlerResult, Router, TypedHandler};
use crate::protocol::{Request, Verb};
use crate::session::server::ServerSession;
use crate::transport::Listener;

/// Pause after a failed accept before trying again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Builder for a [`Server`].
///
/// Routes added here are registered in order when the server is built;
/// more can be added later through [`Server::router`].
pub struct ServerBuilder {
    config: ServerConfig,
    routes: Vec<(Verb, String, Arc<dyn Handler>)>,
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            routes: Vec::new(),
        }
    }

    /// Register a handler for `(verb, resource)`.
    pub fn route<F>(mut self, verb: Verb, resource: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&Request) -> HandlerResult + Send + Sync + 'static,
    {
        self.routes.push((verb, resource.into(), Arc::new(handler)));
        self
    }

    /// Register a handler that receives the body deserialized into `T`.
    pub fn route_typed<T, F>(mut self, verb: Verb, resource: impl Into<String>, handler: F) -> Self
    where
        F: Fn(T, &Request) -> HandlerResult + Send + Sync + 'static,
        T: DeserializeOwned + 'static,
    {
        self.routes
            .push((verb, resource.into(), Arc::new(TypedHandler::new(handler))));
        self
    }

    /// Register any [`Handler`] implementation.
    pub fn handler(mut self, verb: Verb, resource: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        self.routes.push((verb, resource.into(), handler));
        self
    }

    /// Include a traceback in `500` bodies.
    ///
    /// Default: on in debug builds, off in release builds
    pub fn diagnostics(mut self, enabled: bool) -> Self {
        self.config.diagnostics = enabled;
        self
    }

    /// Set the maximum number of handlers running at once.
    ///
    /// Requests beyond the limit wait for a slot; the session stops reading
    /// the channel meanwhile. A limit of 0 is treated as 1.
    /// Default: 256
    pub fn max_concurrent_handlers(mut self, limit: usize) -> Self {
        self.config.max_concurrent_handlers = limit;
        self
    }

    /// Set the wire format and compression.
    pub fn codec(mut self, codec: CodecConfig) -> Self {
        self.config.codec = codec;
        self
    }

    /// Set the largest accepted frame payload.
    ///
    /// Default: 16 MiB
    pub fn max_frame_size(mut self, bytes: u32) -> Self {
        self.config.max_frame_size = bytes;
        self
    }

    /// Set the maximum pending outbound frames per session.
    ///
    /// Default: 1024
    pub fn max_pending_frames(mut self, limit: usize) -> Self {
        self.config.writer.max_pending_frames = limit;
        self
    }

    /// Set the writer channel capacity.
    ///
    /// Default: 1024
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.writer.channel_capacity = capacity;
        self
    }

    /// Set the backpressure timeout.
    ///
    /// Default: 5 seconds
    pub fn backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.config.writer.backpressure_timeout = timeout;
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Server {
        let server = Server::new(self.config);
        for (verb, resource, handler) in self.routes {
            server.router.register_handler(verb, resource, handler);
        }
        server
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A korv server. Cheap to clone; clones share the router.
#[derive(Clone)]
pub struct Server {
    router: Arc<Router>,
    config: ServerConfig,
    limiter: Arc<Semaphore>,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Server with no routes.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            router: Arc::new(Router::with_diagnostics(config.diagnostics)),
            limiter: Arc::new(Semaphore::new(config.max_concurrent_handlers.max(1))),
            config,
        }
    }

    /// The shared router; registering on it affects live sessions.
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Run one session over an already established channel.
    ///
    /// Returns once the peer closes its side and every in-flight request
    /// has been answered.
    pub async fn serve_connection<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.serve_stream(stream, "channel").await
    }

    /// Accept connections forever, one session task per connection.
    pub async fn serve(&self, listener: Listener) -> Result<()> {
        self.serve_with_shutdown(listener, std::future::pending()).await
    }

    /// Accept connections until `shutdown` completes.
    ///
    /// Sessions still open at shutdown are aborted.
    pub async fn serve_with_shutdown<F>(&self, listener: Listener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut sessions = JoinSet::new();
        match listener.local_endpoint() {
            Ok(endpoint) => tracing::info!("Listening on {}", endpoint),
            Err(e) => tracing::warn!("Listening on an unknown endpoint: {}", e),
        }

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutdown requested, {} sessions open", sessions.len());
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((connection, peer)) => {
                        tracing::debug!("Accepted connection from {}", peer);
                        let server = self.clone();
                        sessions.spawn(async move {
                            if let Err(e) = server.serve_stream(connection, &peer).await {
                                tracing::warn!("Session with {} ended with error: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Accept failed: {}", e);
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                },
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!("Session task failed: {}", e);
                    }
                }
            }
        }

        sessions.shutdown().await;
        Ok(())
    }

    async fn serve_stream<S>(&self, stream: S, peer: &str) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        ServerSession::new(self.router.clone(), &self.config, self.limiter.clone())
            .run(reader, writer, peer)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Reply;

    #[test]
    fn test_builder_configuration() {
        let builder = Server::builder()
            .diagnostics(true)
            .max_concurrent_handlers(8)
            .max_frame_size(1024)
            .max_pending_frames(16)
            .channel_capacity(32)
            .backpressure_timeout(Duration::from_secs(1));

        assert!(builder.config.diagnostics);
        assert_eq!(builder.config.max_concurrent_handlers, 8);
        assert_eq!(builder.config.max_frame_size, 1024);
        assert_eq!(builder.config.writer.max_pending_frames, 16);
        assert_eq!(builder.config.writer.channel_capacity, 32);
        assert_eq!(builder.config.writer.backpressure_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_zero_handler_limit_still_admits_one() {
        let server = Server::builder().max_concurrent_handlers(0).build();
        assert_eq!(server.limiter.available_permits(), 1);
    }

    #[test]
    fn test_routes_registered_in_order() {
        let server = Server::builder()
            .route(Verb::Get, "/a", |_| Ok(Reply::status(200)))
            .route(Verb::Get, "/a", |_| Ok(Reply::status(201)))
            .route_typed(Verb::Store, "/b", |_body: serde_json::Value, _| Ok(Reply::status(200)))
            .diagnostics(false)
            .build();

        assert!(!server.router().diagnostics());
        let routes = server.router().routes();
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].handlers, 2);

        let request = Request::new(crate::protocol::MessageId::Number(1), Verb::Get, "/a", None);
        let codes: Vec<u16> = server
            .router()
            .dispatch(&request)
            .iter()
            .map(|r| r.code.as_u16())
            .collect();
        assert_eq!(codes, vec![200, 201]);
    }

    #[tokio::test]
    async fn test_serve_with_shutdown_stops_accepting() {
        let server = Server::builder().build();
        let listener = Listener::bind(&crate::transport::Endpoint::tcp("127.0.0.1", 0))
            .await
            .unwrap();

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            server
                .serve_with_shutdown(listener, async {
                    let _ = stop_rx.await;
                })
                .await
        });

        stop_tx.send(()).unwrap();
        task.await.unwrap().unwrap();
    }
}
