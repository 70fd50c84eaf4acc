use std::mem;
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use futures::SinkExt;
use tokio::io::AsyncWrite;
use tokio_util::codec::{BytesCodec, FramedWrite};
use tracing::trace;

use crate::connection::channel::{Channel, FlushBatch};
use crate::protocol::SendError;

/// Moves flush batches from the channel to the socket.
///
/// A batch is handed to the sink whole and its writes are resolved once the sink flushed it.
pub(crate) struct FlushWriter<W> {
    framed_write: FramedWrite<W, BytesCodec>,
    in_flight: Option<FlushBatch>,
}

impl<W> FlushWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub(crate) fn new(writer: W) -> Self {
        Self { framed_write: FramedWrite::new(writer, BytesCodec::new()), in_flight: None }
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.in_flight.is_none()
    }

    /// Writes batches until the channel has none left.
    ///
    /// On error every write of the failed batch is resolved with the error; the caller is
    /// expected to close the channel, which fails the remaining batches.
    pub(crate) fn poll_drive(&mut self, cx: &mut Context<'_>, channel: &mut Channel) -> Poll<Result<(), SendError>> {
        loop {
            if self.in_flight.is_none() {
                if !channel.has_batches() {
                    return Poll::Ready(Ok(()));
                }
                ready!(SinkExt::<Bytes>::poll_ready_unpin(&mut self.framed_write, cx))?;
                let Some(mut batch) = channel.next_batch() else {
                    return Poll::Ready(Ok(()));
                };

                let bytes = mem::take(&mut batch.bytes);
                if let Err(e) = self.framed_write.start_send_unpin(bytes) {
                    let e = SendError::from(e);
                    batch.resolve(Err(e.clone()));
                    return Poll::Ready(Err(e));
                }
                self.in_flight = Some(batch);
            }

            let result = ready!(SinkExt::<Bytes>::poll_flush_unpin(&mut self.framed_write, cx)).map_err(SendError::from);
            if let Some(batch) = self.in_flight.take() {
                trace!(writes = batch.resolvers.len(), "batch written");
                batch.resolve(result.clone());
            }
            result?;
        }
    }

    pub(crate) async fn shutdown(&mut self) -> Result<(), SendError> {
        SinkExt::<Bytes>::close(&mut self.framed_write).await.map_err(SendError::from)
    }
}
