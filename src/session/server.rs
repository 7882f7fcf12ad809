//! Server side of a session.
//!
//! ```text
//! channel ─► FrameReader ─► decode ─► validate ─┬─► 400 ───────────────────┐
//!                                               └─► spawn_blocking(dispatch) ┴─► writer ─► channel
//! ```
//!
//! Dispatch runs on the blocking pool, bounded by a semaphore shared by every
//! session of the server, so a slow handler never stalls the read loop and
//! responses may leave in any order.

use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::{encode_frame, FrameReader};
use crate::codec::Codec;
use crate::config::ServerConfig;
use crate::error::Result;
use crate::handler::{validate, Router};
use crate::protocol::Response;
use crate::writer::{spawn_writer_task, WriterConfig, WriterHandle};

/// Everything a server session needs besides the channel.
#[derive(Clone)]
pub(crate) struct ServerSession {
    router: Arc<Router>,
    codec: Codec,
    writer_config: WriterConfig,
    max_frame_size: u32,
    limiter: Arc<Semaphore>,
}

impl ServerSession {
    pub(crate) fn new(router: Arc<Router>, config: &ServerConfig, limiter: Arc<Semaphore>) -> Self {
        Self {
            router,
            codec: Codec::new(config.codec),
            writer_config: config.writer.clone(),
            max_frame_size: config.max_frame_size,
            limiter,
        }
    }

    /// Serve one channel until end-of-input.
    ///
    /// Handlers still running at end-of-input are waited for and their
    /// responses flushed before the write half is shut down.
    pub(crate) async fn run<R, W>(self, reader: R, writer: W, peer: &str) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (handle, writer_task) = spawn_writer_task(writer, self.writer_config.clone());
        let mut frames = FrameReader::new(reader, self.max_frame_size);
        let mut in_flight = JoinSet::new();
        tracing::info!("Session established with {}", peer);

        let result = loop {
            let batch = match frames.next_frames().await {
                Ok(Some(batch)) => batch,
                Ok(None) => {
                    tracing::debug!("End of input from {}", peer);
                    break Ok(());
                }
                Err(e) => {
                    tracing::error!("Read error on session with {}: {}", peer, e);
                    break Err(e);
                }
            };

            for payload in batch {
                self.handle_frame(payload, &handle, &mut in_flight).await;
            }
            while let Some(joined) = in_flight.try_join_next() {
                if let Err(e) = joined {
                    tracing::error!("Dispatch task failed: {}", e);
                }
            }
        };

        if !in_flight.is_empty() {
            tracing::debug!("Waiting for {} in-flight requests", in_flight.len());
        }
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                tracing::error!("Dispatch task failed: {}", e);
            }
        }

        handle.close().await;
        drop(handle);
        match writer_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("Writer for {} stopped with error: {}", peer, e),
            Err(e) => tracing::error!("Writer task for {} failed: {}", peer, e),
        }

        tracing::info!("Session with {} closed", peer);
        result
    }

    async fn handle_frame(&self, payload: Bytes, writer: &WriterHandle, in_flight: &mut JoinSet<()>) {
        let value: Value = match self.codec.decode(&payload) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("Dropping undecodable frame of {} bytes: {}", payload.len(), e);
                return;
            }
        };

        let request = match validate(&value) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!("Rejecting request {}: {}", e.request_id, e);
                let response = self.router.reject(&e);
                send_response(&self.codec, writer, self.max_frame_size, &response).await;
                return;
            }
        };
        tracing::debug!("Received {} {} (id {})", request.verb, request.resource, request.id);

        let Ok(permit) = self.limiter.clone().acquire_owned().await else {
            tracing::error!("Handler limiter closed, dropping request {}", request.id);
            return;
        };

        let router = self.router.clone();
        let codec = self.codec;
        let max_frame_size = self.max_frame_size;
        let writer = writer.clone();

        in_flight.spawn(async move {
            let _permit = permit;
            let responses = match tokio::task::spawn_blocking(move || router.dispatch(&request)).await {
                Ok(responses) => responses,
                Err(e) => {
                    tracing::error!("Dispatch failed: {}", e);
                    return;
                }
            };
            for response in &responses {
                send_response(&codec, &writer, max_frame_size, response).await;
            }
        });
    }
}

async fn send_response(codec: &Codec, writer: &WriterHandle, max_frame_size: u32, response: &Response) {
    let frame = match encode_frame(codec, response, max_frame_size) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::error!("Failed to encode response to {}: {}", response.request_id, e);
            return;
        }
    };
    if let Err(e) = writer.send(frame).await {
        tracing::warn!("Could not send response to {}: {}", response.request_id, e);
    }
}
