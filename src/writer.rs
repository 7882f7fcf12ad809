//! Dedicated writer task owning the write half of a channel.
//!
//! Every outbound frame, from the receive loop or from any caller thread, is
//! handed to this task through a bounded mpsc channel, so the channel itself
//! never needs a lock.
//!
//! ```text
//! Handler task ─┐
//! Caller thread ┼─► mpsc::Sender<Outbound> ─► Writer Task ─► channel
//! Read loop    ─┘
//! ```
//!
//! Frames queued at the same time are written with a single vectored write.
//! [`WriterHandle::close`] flushes and shuts the write half down, which the
//! peer observes as end-of-input.

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::error::{KorvError, Result};
use crate::protocol::{encode_header, payload_len, HEADER_SIZE};

/// Default maximum pending frames before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default backpressure timeout.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// How often a blocked thread re-checks the backlog.
const BLOCKING_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// A frame ready to be written.
#[derive(Debug)]
pub struct OutboundFrame {
    /// Pre-encoded length prefix.
    pub header: [u8; HEADER_SIZE],
    /// Encoded message.
    pub payload: Bytes,
}

impl OutboundFrame {
    /// Frame an encoded message, enforcing the size limit.
    pub fn new(payload: Bytes, max_frame_size: u32) -> Result<Self> {
        let len = payload_len(&payload, max_frame_size)?;
        Ok(Self {
            header: encode_header(len),
            payload,
        })
    }

    /// Total size on the wire (header + payload).
    #[inline]
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Commands understood by the writer task.
#[derive(Debug)]
enum Outbound {
    Frame(OutboundFrame),
    Close,
}

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Maximum pending frames before backpressure kicks in.
    pub max_pending_frames: usize,
    /// Channel capacity for the frame queue.
    pub channel_capacity: usize,
    /// Timeout when waiting for backpressure to clear.
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Frames handed to the writer task but not yet written.
#[derive(Debug, Default)]
struct Backlog {
    frames: AtomicUsize,
    drained: Notify,
}

impl Backlog {
    fn len(&self) -> usize {
        self.frames.load(Ordering::Acquire)
    }

    fn grow(&self) {
        self.frames.fetch_add(1, Ordering::AcqRel);
    }

    fn shrink(&self, written: usize) {
        self.frames.fetch_sub(written, Ordering::AcqRel);
        self.drained.notify_waiters();
    }
}

/// Handle for sending frames to the writer task. Cheap to clone.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<Outbound>,
    backlog: Arc<Backlog>,
    max_pending: usize,
    timeout: Duration,
}

impl WriterHandle {
    /// Queue a frame, waiting out backpressure up to the configured timeout.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        if self.is_backpressure_active() {
            self.drain_below_limit().await?;
        }

        self.backlog.grow();
        self.tx.send(Outbound::Frame(frame)).await.map_err(|_| {
            self.backlog.shrink(1);
            KorvError::ConnectionClosed
        })
    }

    /// Queue a frame from a thread that is not running the event loop.
    ///
    /// Blocks the calling thread while backpressure is active, failing with
    /// [`KorvError::BackpressureTimeout`] once the configured timeout passes.
    /// Must not be called from async code: it panics inside a tokio runtime.
    pub fn blocking_send(&self, frame: OutboundFrame) -> Result<()> {
        if self.is_backpressure_active() {
            self.blocking_drain_below_limit()?;
        }

        self.backlog.grow();
        self.tx.blocking_send(Outbound::Frame(frame)).map_err(|_| {
            self.backlog.shrink(1);
            KorvError::ConnectionClosed
        })
    }

    /// Queue a frame only if that needs no waiting.
    ///
    /// Fails with [`KorvError::BackpressureTimeout`] when the backlog or the
    /// channel is full.
    pub fn try_send(&self, frame: OutboundFrame) -> Result<()> {
        if self.is_backpressure_active() {
            return Err(KorvError::BackpressureTimeout);
        }

        self.backlog.grow();
        self.tx.try_send(Outbound::Frame(frame)).map_err(|e| {
            self.backlog.shrink(1);
            match e {
                mpsc::error::TrySendError::Full(_) => KorvError::BackpressureTimeout,
                mpsc::error::TrySendError::Closed(_) => KorvError::ConnectionClosed,
            }
        })
    }

    /// Flush everything queued so far, then shut the write half down.
    ///
    /// Frames queued after this call are discarded.
    pub async fn close(&self) {
        // A closed channel means the task is already gone.
        let _ = self.tx.send(Outbound::Close).await;
    }

    async fn drain_below_limit(&self) -> Result<()> {
        let drained = async {
            loop {
                let notified = self.backlog.drained.notified();
                if !self.is_backpressure_active() {
                    return;
                }
                notified.await;
            }
        };

        tokio::time::timeout(self.timeout, drained)
            .await
            .map_err(|_| KorvError::BackpressureTimeout)
    }

    fn blocking_drain_below_limit(&self) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        while self.is_backpressure_active() {
            if self.is_closed() {
                return Err(KorvError::ConnectionClosed);
            }
            if Instant::now() >= deadline {
                return Err(KorvError::BackpressureTimeout);
            }
            std::thread::sleep(BLOCKING_POLL_INTERVAL);
        }
        Ok(())
    }

    /// True while the backlog is at or above `max_pending_frames`.
    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.backlog.len() >= self.max_pending
    }

    /// Frames queued but not yet written.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.backlog.len()
    }

    /// True once the writer task has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Start the writer task for `writer`.
///
/// The task ends when [`WriterHandle::close`] is called, when every handle
/// is dropped, or on the first write error.
pub fn spawn_writer_task<W>(writer: W, config: WriterConfig) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let backlog = Arc::new(Backlog::default());

    let handle = WriterHandle {
        tx,
        backlog: backlog.clone(),
        max_pending: config.max_pending_frames,
        timeout: config.backpressure_timeout,
    };

    let task = tokio::spawn(async move {
        let result = writer_loop(rx, writer, &backlog).await;
        if let Err(e) = &result {
            tracing::error!("Writer task failed: {}", e);
        }
        result
    });

    (handle, task)
}

async fn writer_loop<W>(mut rx: mpsc::Receiver<Outbound>, mut writer: W, backlog: &Backlog) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let Some(first) = rx.recv().await else {
            // Every handle dropped.
            writer.shutdown().await?;
            return Ok(());
        };

        let mut frames = Vec::with_capacity(MAX_BATCH_SIZE);
        let mut close = false;
        match first {
            Outbound::Frame(frame) => frames.push(frame),
            Outbound::Close => close = true,
        }

        while !close && frames.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(Outbound::Frame(frame)) => frames.push(frame),
                Ok(Outbound::Close) => close = true,
                Err(_) => break,
            }
        }

        if !frames.is_empty() {
            write_batch(&mut writer, &frames).await?;
            tracing::debug!("Wrote {} frames", frames.len());
            backlog.shrink(frames.len());
        }

        if close {
            tracing::debug!("Writer closing channel");
            rx.close();
            writer.shutdown().await?;
            return Ok(());
        }
    }
}

/// Write a batch of frames with scatter/gather I/O.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let mut slices: Vec<IoSlice<'_>> = Vec::with_capacity(batch.len() * 2);
    for frame in batch {
        slices.push(IoSlice::new(&frame.header));
        if !frame.payload.is_empty() {
            slices.push(IoSlice::new(&frame.payload));
        }
    }

    let total_size: usize = batch.iter().map(OutboundFrame::size).sum();
    let mut total_written = writer.write_vectored(&slices).await?;

    // Partial write: rebuild slices past what the kernel took.
    while total_written < total_size {
        if total_written == 0 {
            return Err(KorvError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }

        let remaining = build_remaining_slices(batch, total_written);
        let written = writer.write_vectored(&remaining).await?;
        if written == 0 {
            return Err(KorvError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// IoSlice array for the data left after `skip_bytes` were written.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    let mut offset = 0;

    for frame in batch {
        let parts: [&[u8]; 2] = [&frame.header, &frame.payload];
        for part in parts {
            let end = offset + part.len();
            if skip_bytes < end && !part.is_empty() {
                slices.push(IoSlice::new(&part[skip_bytes.saturating_sub(offset)..]));
            }
            offset = end;
        }
    }

    slices
}
