//! Client side of a session: responses in, correlation table out.

use std::sync::Arc;

use tokio::io::AsyncRead;

use super::{FrameReader, SessionState, StateCell};
use crate::codec::Codec;
use crate::correlation::CorrelationTable;
use crate::protocol::Response;
use crate::writer::WriterHandle;

/// Receive responses until end-of-input, then close the session.
///
/// Every request still pending at that point is abandoned with
/// `ChannelClosed` and the write half is shut down.
pub(crate) async fn receive_responses<R>(
    mut frames: FrameReader<R>,
    codec: Codec,
    table: Arc<CorrelationTable>,
    state: Arc<StateCell>,
    writer: WriterHandle,
) where
    R: AsyncRead + Unpin,
{
    state.set(SessionState::Established);
    tracing::info!("Client session established");

    loop {
        let batch = match frames.next_frames().await {
            Ok(Some(batch)) => batch,
            Ok(None) => {
                tracing::info!("Server closed the channel");
                break;
            }
            Err(e) => {
                tracing::error!("Client read error: {}", e);
                break;
            }
        };

        for payload in batch {
            match codec.decode::<Response>(&payload) {
                Ok(response) => {
                    tracing::debug!(
                        "Response {} for request {}: {}",
                        response.id,
                        response.request_id,
                        response.code
                    );
                    table.resolve(response);
                }
                Err(e) => {
                    tracing::warn!("Dropping undecodable response of {} bytes: {}", payload.len(), e);
                }
            }
        }
    }

    state.set(SessionState::Closed);
    let abandoned = table.len();
    table.close();
    if abandoned > 0 {
        tracing::warn!("Channel closed with {} requests pending", abandoned);
    }
    writer.close().await;
}
