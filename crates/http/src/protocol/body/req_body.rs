use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::channel::mpsc;
use futures::{Stream, StreamExt};
use http_body::{Body, Frame, SizeHint};
use tracing::{debug, trace};

use crate::protocol::{ParseError, PayloadSize};

type BodyItem = Result<Bytes, ParseError>;

/// Size of an inbound item, used to account for discarded input.
pub(crate) trait InboundItem: Send + 'static {
    fn size(&self) -> usize;
}

impl InboundItem for Bytes {
    fn size(&self) -> usize {
        self.len()
    }
}

/// Creates the two halves of a bounded inbound stream.
///
/// `depth` bounds how many items may be queued before the connection stops reading from the
/// socket.
pub(crate) fn inbound_channel<T: InboundItem>(depth: usize) -> (InboundSender<T>, mpsc::Receiver<Result<T, ParseError>>) {
    let (sender, receiver) = mpsc::channel(depth);
    (InboundSender { sender: Some(sender), pending: None, closing: false, skipped: 0 }, receiver)
}

/// Creates the two halves of an inbound body.
pub(crate) fn body_channel(payload_size: PayloadSize, depth: usize) -> (BodySender, ReqBody) {
    let (sender, receiver) = inbound_channel(depth);
    (sender, ReqBody { receiver, payload_size })
}

/// The inbound body stream handed to the handler.
///
/// It yields each content chunk in order and ends after the terminal chunk. If the connection
/// fails before the terminal chunk arrives, the last item is an error.
#[derive(Debug)]
pub struct ReqBody {
    receiver: mpsc::Receiver<BodyItem>,
    payload_size: PayloadSize,
}

impl ReqBody {
    /// A body that is already complete.
    pub fn empty() -> Self {
        let (_sender, receiver) = mpsc::channel(0);
        Self { receiver, payload_size: PayloadSize::Empty }
    }

    pub fn payload_size(&self) -> PayloadSize {
        self.payload_size
    }
}

impl Stream for ReqBody {
    type Item = BodyItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_next_unpin(cx)
    }
}

impl Body for ReqBody {
    type Data = Bytes;
    type Error = ParseError;

    fn poll_frame(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        self.receiver.poll_next_unpin(cx).map(|item| item.map(|result| result.map(Frame::data)))
    }

    fn size_hint(&self) -> SizeHint {
        self.payload_size.into()
    }
}

pub(crate) type BodySender = InboundSender<Bytes>;

/// Connection side of an inbound stream.
///
/// Items are offered without waiting; when the consumer is slow the item is parked and the
/// connection polls [`InboundSender::poll_flush`] before reading more. When the consumer dropped
/// its receiver, items are discarded so the request can still be drained for keep-alive.
#[derive(Debug)]
pub(crate) struct InboundSender<T> {
    sender: Option<mpsc::Sender<Result<T, ParseError>>>,
    pending: Option<Result<T, ParseError>>,
    closing: bool,
    skipped: usize,
}

impl<T: InboundItem> InboundSender<T> {
    pub(crate) fn offer(&mut self, item: Result<T, ParseError>) {
        debug_assert!(self.pending.is_none(), "body chunk offered while another one is parked");
        let Some(sender) = &mut self.sender else {
            self.skip(&item);
            return;
        };

        match sender.try_send(item) {
            Ok(()) => {}
            Err(e) if e.is_full() => self.pending = Some(e.into_inner()),
            Err(e) => {
                let item = e.into_inner();
                self.skip(&item);
                self.sender = None;
            }
        }
    }

    pub(crate) fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Pushes the parked chunk once the handler made room.
    pub(crate) fn poll_flush(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        let Some(sender) = &mut self.sender else {
            if let Some(item) = self.pending.take() {
                self.skip(&item);
            }
            return Poll::Ready(());
        };

        if self.pending.is_some() {
            match sender.poll_ready(cx) {
                Poll::Ready(Ok(())) => {
                    if let Some(item) = self.pending.take() {
                        if sender.start_send(item).is_err() {
                            self.sender = None;
                        }
                    }
                }
                Poll::Ready(Err(_)) => {
                    if let Some(item) = self.pending.take() {
                        self.skip(&item);
                    }
                    self.sender = None;
                }
                Poll::Pending => return Poll::Pending,
            }
        }

        if self.closing {
            self.sender = None;
        }
        Poll::Ready(())
    }

    /// Stops delivering, everything offered from now on is discarded.
    pub(crate) fn discard(&mut self) {
        if let Some(item) = self.pending.take() {
            self.skip(&item);
        }
        self.sender = None;
    }

    /// Ends the stream after any parked chunk was delivered.
    pub(crate) fn finish(&mut self) {
        if self.pending.is_some() {
            self.closing = true;
        } else {
            self.sender = None;
        }
        if self.skipped > 0 {
            debug!(size = self.skipped, "skip inbound data");
        }
    }

    /// Ends the stream with an error.
    pub(crate) fn fail(&mut self, e: ParseError) {
        if let Some(sender) = &mut self.sender {
            if self.pending.is_none() {
                let _ = sender.try_send(Err(e));
            }
        }
        self.pending = None;
        self.sender = None;
    }

    fn skip(&mut self, item: &Result<T, ParseError>) {
        if let Ok(item) = item {
            self.skipped += item.size();
            trace!(size = item.size(), "inbound consumer gone, discard item");
        }
    }
}

impl From<PayloadSize> for SizeHint {
    fn from(payload_size: PayloadSize) -> Self {
        match payload_size {
            PayloadSize::Length(length) => SizeHint::with_exact(length),
            PayloadSize::Chunked | PayloadSize::UntilClose => SizeHint::new(),
            PayloadSize::Empty => SizeHint::with_exact(0),
        }
    }
}
