//! Client builder, async client and blocking client.
//!
//! A client owns one channel. Requests are numbered from 1, registered in
//! the [correlation table](crate::correlation) and handed to the writer
//! task; a background read task resolves them as responses arrive, in
//! whatever order the server sends them.
//!
//! # Example
//!
//! ```no_run
//! use korv::transport::Endpoint;
//! use korv::{Client, Status};
//!
//! # async fn run() -> korv::Result<()> {
//! let endpoint: Endpoint = "tcp://127.0.0.1:8022".parse()?;
//! let client = Client::builder().connect(&endpoint).await?;
//!
//! let response = client.get("/hello").await?;
//! assert_eq!(response.code, Status::OK);
//! # Ok(())
//! # }
//! ```
//!
//! [`BlockingClient`] offers the same calls to plain threads: the event loop
//! runs on a runtime owned by the client and only the calling thread blocks.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::runtime::Runtime;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::codec::{Codec, CodecConfig};
use crate::config::ClientConfig;
use crate::correlation::{Abandoned, Completion, CorrelationTable, Outcome};
use crate::error::{KorvError, Result};
use crate::protocol::{IdGenerator, MessageId, Request, Response, Verb};
use crate::session::client::receive_responses;
use crate::session::{encode_frame, FrameReader, SessionState, StateCell};
use crate::transport::{self, Endpoint};
use crate::writer::{spawn_writer_task, OutboundFrame, WriterHandle};

/// Name of the thread running a [`BlockingClient`]'s event loop.
const EVENT_LOOP_THREAD_NAME: &str = "korv-event-loop";

/// Builder for [`Client`] and [`BlockingClient`].
pub struct ClientBuilder {
    config: ClientConfig,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
        }
    }

    /// Set the wire format and compression.
    pub fn codec(mut self, codec: CodecConfig) -> Self {
        self.config.codec = codec;
        self
    }

    /// Set how long a request waits for its response. `None` waits forever.
    ///
    /// Default: 30 seconds
    pub fn request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Set the largest accepted frame payload.
    ///
    /// Default: 16 MiB
    pub fn max_frame_size(mut self, bytes: u32) -> Self {
        self.config.max_frame_size = bytes;
        self
    }

    /// Set the maximum pending outbound frames.
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
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Connect to `endpoint` and start the session.
    pub async fn connect(self, endpoint: &Endpoint) -> Result<Client> {
        let connection = transport::connect(endpoint).await?;
        tracing::info!("Connected to {}", endpoint);
        Ok(self.attach(connection))
    }

    /// Start a session over an already established channel.
    ///
    /// Must be called from within a tokio runtime.
    pub fn attach<S>(self, stream: S) -> Client
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let config = self.config;
        let codec = Codec::new(config.codec);
        let (reader, writer) = tokio::io::split(stream);
        let (writer, writer_task) = spawn_writer_task(writer, config.writer.clone());

        let table = Arc::new(CorrelationTable::new());
        let state = Arc::new(StateCell::new(SessionState::Opening));
        let reader_task = tokio::spawn(receive_responses(
            FrameReader::new(reader, config.max_frame_size),
            codec,
            table.clone(),
            state.clone(),
            writer.clone(),
        ));

        Client {
            ids: IdGenerator::new(),
            table,
            writer,
            codec,
            max_frame_size: config.max_frame_size,
            request_timeout: config.request_timeout,
            state,
            reader_task,
            _writer_task: writer_task,
        }
    }

    /// Connect to `endpoint` from a plain thread.
    pub fn connect_blocking(self, endpoint: &Endpoint) -> Result<BlockingClient> {
        let runtime = event_loop()?;
        let client = runtime.block_on(self.connect(endpoint))?;
        Ok(BlockingClient { client, runtime })
    }

    /// Start a blocking session over an already established channel.
    pub fn attach_blocking<S>(self, stream: S) -> Result<BlockingClient>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let runtime = event_loop()?;
        let client = {
            let _guard = runtime.enter();
            self.attach(stream)
        };
        Ok(BlockingClient { client, runtime })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn event_loop() -> Result<Runtime> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name(EVENT_LOOP_THREAD_NAME)
        .enable_all()
        .build()?;
    Ok(runtime)
}

/// Async client over one channel.
///
/// Dropping the client stops the read task and abandons every pending
/// request with `ChannelClosed`.
pub struct Client {
    ids: IdGenerator,
    table: Arc<CorrelationTable>,
    writer: WriterHandle,
    codec: Codec,
    max_frame_size: u32,
    request_timeout: Option<Duration>,
    state: Arc<StateCell>,
    reader_task: JoinHandle<()>,
    _writer_task: JoinHandle<Result<()>>,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Send a request; `callback` receives its outcome exactly once.
    ///
    /// The callback runs on the read task and must not block. If the request
    /// cannot be queued the callback is told so and the error is returned
    /// as well.
    pub async fn call_with<F>(
        &self,
        verb: Verb,
        resource: impl Into<String>,
        body: Option<Value>,
        callback: F,
    ) -> Result<MessageId>
    where
        F: FnOnce(Outcome) + Send + 'static,
    {
        let (id, frame) = self.prepare(verb, resource, body)?;
        self.table.register(id.clone(), Completion::callback(callback))?;

        if let Err(e) = self.writer.send(frame).await {
            let reason = match e {
                KorvError::ConnectionClosed => Abandoned::ChannelClosed,
                _ => Abandoned::Cancelled,
            };
            self.table.cancel(&id, reason);
            return Err(e);
        }
        Ok(id)
    }

    /// Send a request and wait for its first response.
    ///
    /// # Errors
    ///
    /// [`KorvError::Timeout`] once the configured request timeout expires,
    /// [`KorvError::Cancelled`] if [`cancel`](Self::cancel) was called, and
    /// [`KorvError::ConnectionClosed`] if the channel went away first.
    pub async fn request(
        &self,
        verb: Verb,
        resource: impl Into<String>,
        body: Option<Value>,
    ) -> Result<Response> {
        let (tx, rx) = oneshot::channel();
        let id = self
            .call_with(verb, resource, body, move |outcome| {
                let _ = tx.send(outcome);
            })
            .await?;

        let received = match self.request_timeout {
            None => rx.await,
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received,
                Err(_) => {
                    tracing::debug!("Request {} timed out after {:?}", id, limit);
                    self.table.cancel(&id, Abandoned::TimedOut);
                    return Err(KorvError::Timeout(id));
                }
            },
        };

        match received {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(reason)) => Err(reason.into_error(id)),
            Err(_) => Err(KorvError::ConnectionClosed),
        }
    }

    pub async fn get(&self, resource: impl Into<String>) -> Result<Response> {
        self.request(Verb::Get, resource, None).await
    }

    pub async fn store(&self, resource: impl Into<String>, body: Value) -> Result<Response> {
        self.request(Verb::Store, resource, Some(body)).await
    }

    pub async fn update(&self, resource: impl Into<String>, body: Value) -> Result<Response> {
        self.request(Verb::Update, resource, Some(body)).await
    }

    pub async fn delete(&self, resource: impl Into<String>) -> Result<Response> {
        self.request(Verb::Delete, resource, None).await
    }

    /// Abandon a pending request locally. The server is not told.
    ///
    /// Returns `false` if the request had already completed.
    pub fn cancel(&self, id: &MessageId) -> bool {
        self.table.cancel(id, Abandoned::Cancelled)
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    /// Number of requests still waiting for a response.
    pub fn pending(&self) -> usize {
        self.table.len()
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }

    /// Stop sending.
    ///
    /// The server sees end-of-input, answers what it already received and
    /// closes its side; the session is closed after that.
    pub async fn close(&self) {
        self.writer.close().await;
    }

    fn prepare(
        &self,
        verb: Verb,
        resource: impl Into<String>,
        body: Option<Value>,
    ) -> Result<(MessageId, OutboundFrame)> {
        let request = Request::new(self.ids.next_id(), verb, resource, body);
        let frame = encode_frame(&self.codec, &request, self.max_frame_size)?;
        tracing::debug!("Sending {} {} (id {})", request.verb, request.resource, request.id);
        Ok((request.id, frame))
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.reader_task.abort();
        self.table.close();
    }
}

/// Client for callers outside any async runtime.
///
/// Owns a runtime with a single worker thread that runs the session. Any
/// number of threads may call concurrently; each blocks only itself.
/// Neither the calls nor dropping the client may happen inside an async
/// context.
pub struct BlockingClient {
    client: Client,
    runtime: Runtime,
}

impl BlockingClient {
    /// Connect with the default configuration.
    pub fn connect(endpoint: &Endpoint) -> Result<Self> {
        ClientBuilder::new().connect_blocking(endpoint)
    }

    /// Send a request and block until its first response arrives.
    pub fn call(&self, verb: Verb, resource: impl Into<String>, body: Option<Value>) -> Result<Response> {
        self.call_timeout(verb, resource, body, self.client.request_timeout)
    }

    /// Like [`call`](Self::call) with an explicit timeout.
    pub fn call_timeout(
        &self,
        verb: Verb,
        resource: impl Into<String>,
        body: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Response> {
        let client = &self.client;
        let (id, frame) = client.prepare(verb, resource, body)?;
        client.table.register(id.clone(), Completion::Blocking)?;

        if let Err(e) = client.writer.blocking_send(frame) {
            tracing::warn!("Could not send request {}: {}", id, e);
            client.table.cancel(&id, Abandoned::Cancelled);
            // Already resolved, so this returns at once and frees the entry.
            let _ = client.table.await_blocking(&id, None);
            return Err(e);
        }
        client.table.await_blocking(&id, timeout)
    }

    /// Send a request without waiting; `callback` runs on the event loop.
    pub fn call_with<F>(
        &self,
        verb: Verb,
        resource: impl Into<String>,
        body: Option<Value>,
        callback: F,
    ) -> Result<MessageId>
    where
        F: FnOnce(Outcome) + Send + 'static,
    {
        self.runtime
            .block_on(self.client.call_with(verb, resource, body, callback))
    }

    pub fn get(&self, resource: impl Into<String>) -> Result<Response> {
        self.call(Verb::Get, resource, None)
    }

    pub fn store(&self, resource: impl Into<String>, body: Value) -> Result<Response> {
        self.call(Verb::Store, resource, Some(body))
    }

    pub fn update(&self, resource: impl Into<String>, body: Value) -> Result<Response> {
        self.call(Verb::Update, resource, Some(body))
    }

    pub fn delete(&self, resource: impl Into<String>) -> Result<Response> {
        self.call(Verb::Delete, resource, None)
    }

    pub fn cancel(&self, id: &MessageId) -> bool {
        self.client.cancel(id)
    }

    pub fn state(&self) -> SessionState {
        self.client.state()
    }

    pub fn pending(&self) -> usize {
        self.client.pending()
    }

    /// Stop sending; see [`Client::close`].
    pub fn close(&self) {
        self.runtime.block_on(self.client.close());
    }

    /// The async client underneath.
    pub fn as_async(&self) -> &Client {
        &self.client
    }
}
