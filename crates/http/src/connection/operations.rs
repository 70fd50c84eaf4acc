//! Per-exchange state of a connection and the [`Outbound`] views bridges write through.
//!
//! A connection holds at most one [`Operations`] at a time: the HTTP exchange in progress, or the
//! WebSocket session it was upgraded to. Every exchange gets a fresh stream id; signals carrying
//! another id are stale and ignored.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::FutureExt;
use futures::channel::mpsc::{self, UnboundedSender};
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use tokio_util::codec::Encoder;
use tracing::trace;

use crate::bridge::{Cancellation, CompletionPromise, FlushBridge, Listen, Outbound, Terminated, WriteHandle};
use crate::codec::{Frame, FrameCodec, ResponseEncoder};
use crate::connection::channel::Channel;
use crate::handler::WebSocketHandler;
use crate::protocol::body::{BodySender, InboundItem, InboundSender};
use crate::protocol::{BoxError, Cookies, HttpError, Message, ParseError, PayloadItem, PayloadSize, RequestHeader, ResponseHead, ResponseState, SendError};
use crate::reactive::{Subscriber, Subscription, Unit};

impl InboundItem for Frame {
    fn size(&self) -> usize {
        self.payload().len()
    }
}

/// Signals of a demand source, tagged with the exchange they belong to.
#[derive(Debug)]
pub(crate) enum Event {
    Subscribe { stream: u64, subscription: Arc<dyn Subscription> },
    Next { stream: u64, unit: Option<Unit> },
    Error { stream: u64, error: BoxError },
    Complete { stream: u64 },
}

impl Event {
    pub(crate) fn stream(&self) -> u64 {
        match self {
            Event::Subscribe { stream, .. } | Event::Next { stream, .. } | Event::Error { stream, .. } | Event::Complete { stream } => {
                *stream
            }
        }
    }
}

/// Forwards the signals of a source into the connection mailbox.
#[derive(Debug)]
pub(crate) struct MailboxSubscriber {
    stream: u64,
    mailbox: UnboundedSender<Event>,
    subscription: Option<Arc<dyn Subscription>>,
}

impl MailboxSubscriber {
    pub(crate) fn new(stream: u64, mailbox: UnboundedSender<Event>) -> Self {
        Self { stream, mailbox, subscription: None }
    }

    fn post(&mut self, event: Event) {
        if self.mailbox.unbounded_send(event).is_err() {
            // connection is gone, stop the source
            if let Some(subscription) = self.subscription.take() {
                trace!(stream = self.stream, "connection gone, cancel source");
                subscription.cancel();
            }
        }
    }
}

impl Subscriber<Unit> for MailboxSubscriber {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        self.subscription = Some(Arc::clone(&subscription));
        self.post(Event::Subscribe { stream: self.stream, subscription });
    }

    fn on_next(&mut self, unit: Option<Unit>) {
        self.post(Event::Next { stream: self.stream, unit });
    }

    fn on_error(&mut self, error: BoxError) {
        self.post(Event::Error { stream: self.stream, error });
    }

    fn on_complete(&mut self) {
        self.post(Event::Complete { stream: self.stream });
    }
}

/// A write outcome the executor waits for.
#[derive(Debug)]
pub(crate) enum Listened {
    /// Reported back to the bridge of `stream`.
    Bridge { stream: u64, listen: Listen, result: Result<(), SendError> },
    /// The `101 Switching Protocols` head of `stream` reached the socket, or failed to.
    Upgraded { stream: u64, result: Result<(), SendError> },
    /// Nothing left to do, the future already settled what it waited for.
    Settled,
}

pub(crate) type Listeners = FuturesUnordered<BoxFuture<'static, Listened>>;

/// A termination executed after the current event.
#[derive(Debug)]
pub(crate) struct Deferred {
    pub(crate) stream: u64,
    pub(crate) terminated: Terminated,
}

/// Resolves `promise` with the outcome of `handle`, or right away without one.
pub(crate) fn settle(listeners: &mut Listeners, handle: Option<WriteHandle>, mut promise: CompletionPromise) {
    match handle {
        Some(handle) => listeners.push(
            async move {
                promise.complete(handle.await.map_err(HttpError::from));
                Listened::Settled
            }
            .boxed(),
        ),
        None => {
            promise.try_success();
        }
    }
}

#[derive(Debug)]
pub(crate) enum Operations {
    Http(HttpServerOperations),
    WebSocket(WebSocketOperations),
}

impl Operations {
    pub(crate) fn id(&self) -> u64 {
        match self {
            Operations::Http(ops) => ops.id,
            Operations::WebSocket(ops) => ops.id,
        }
    }

    pub(crate) fn bridge_mut(&mut self) -> Option<&mut FlushBridge> {
        match self {
            Operations::Http(ops) => ops.bridge.as_mut(),
            Operations::WebSocket(ops) => ops.bridge.as_mut(),
        }
    }

    /// Whether an inbound item waits for room in the consumer's queue.
    pub(crate) fn has_parked(&self) -> bool {
        match self {
            Operations::Http(ops) => ops.body.as_ref().is_some_and(InboundSender::has_pending),
            Operations::WebSocket(ops) => ops.inbound.as_ref().is_some_and(InboundSender::has_pending),
        }
    }
}

/// State of one HTTP exchange.
#[derive(Debug)]
pub(crate) struct HttpServerOperations {
    pub(crate) id: u64,
    pub(crate) header: Arc<RequestHeader>,
    pub(crate) cookies: Arc<Cookies>,
    pub(crate) response: ResponseState,
    pub(crate) encoder: ResponseEncoder,
    pub(crate) promise: CompletionPromise,
    pub(crate) bridge: Option<FlushBridge>,
    /// The latest body write, the response is complete once it resolves.
    pub(crate) last_write: Option<WriteHandle>,
    pub(crate) body: Option<BodySender>,
    /// Body of a websocket handshake request, collected before the handler runs.
    pub(crate) aggregate: Option<BytesMut>,
    pub(crate) inbound_done: bool,
    pub(crate) outbound_done: bool,
    /// Decided when the head is written.
    pub(crate) keep_alive: bool,
}

impl HttpServerOperations {
    pub(crate) fn new(id: u64, header: RequestHeader, with_date: bool) -> Self {
        let cookies = Cookies::from_headers(header.headers());
        let keep_alive = header.is_keep_alive();
        Self {
            id,
            header: Arc::new(header),
            cookies: Arc::new(cookies),
            response: ResponseState::new(with_date),
            encoder: ResponseEncoder::new(),
            promise: CompletionPromise::none(),
            bridge: None,
            last_write: None,
            body: None,
            aggregate: None,
            inbound_done: false,
            outbound_done: false,
            keep_alive,
        }
    }

    /// Writes the head unless it already went out.
    ///
    /// This is where keep-alive is decided: the request must allow it, the application must not
    /// refuse it, the body must be self-delimited and the peer must still be reading.
    pub(crate) fn send_headers(&mut self, channel: &mut Channel, peer_closed: bool) -> Result<Option<WriteHandle>, SendError> {
        if !self.response.mark_headers_sent() {
            return Ok(None);
        }

        let version = self.header.version();
        let payload_size = self.response.payload_size(version);
        self.keep_alive = self.header.is_keep_alive()
            && self.response.keep_alive().unwrap_or(true)
            && payload_size.is_self_delimited()
            && !peer_closed;
        self.response.apply_connection_header(self.keep_alive, version);

        let head = self.response.head();
        trace!(status = %head.status(), ?payload_size, keep_alive = self.keep_alive, "write response head");
        let encoder = &mut self.encoder;
        channel.write(|dst| encoder.encode(Message::<_, Bytes>::Header((head, payload_size)), dst))
    }

    pub(crate) fn send_payload(&mut self, channel: &mut Channel, item: PayloadItem) -> Result<Option<WriteHandle>, SendError> {
        let encoder = &mut self.encoder;
        channel.write(|dst| encoder.encode(Message::<(ResponseHead, PayloadSize)>::Payload(item), dst))
    }

    /// Writes a head outside the normal response flow, an informational or an error head.
    pub(crate) fn send_head(&mut self, channel: &mut Channel, head: ResponseHead, payload_size: PayloadSize) -> Result<Option<WriteHandle>, SendError> {
        let encoder = &mut self.encoder;
        channel.write(|dst| encoder.encode(Message::<_, Bytes>::Header((head, payload_size)), dst))
    }
}

/// State of an upgraded connection.
pub(crate) struct WebSocketOperations {
    pub(crate) id: u64,
    pub(crate) header: Arc<RequestHeader>,
    pub(crate) codec: FrameCodec,
    pub(crate) plain_text: bool,
    pub(crate) protocol: Option<String>,
    pub(crate) handler: Option<Arc<dyn WebSocketHandler>>,
    pub(crate) promise: CompletionPromise,
    pub(crate) bridge: Option<FlushBridge>,
    pub(crate) inbound: Option<InboundSender<Frame>>,
    pub(crate) inbound_done: bool,
    /// The handshake response was written and the session handler runs.
    pub(crate) started: bool,
}

impl WebSocketOperations {
    pub(crate) fn send_frame(&mut self, channel: &mut Channel, frame: Frame) -> Result<Option<WriteHandle>, SendError> {
        let codec = &mut self.codec;
        channel.write(|dst| codec.encode(frame, dst))
    }

    pub(crate) fn finish_inbound(&mut self) {
        self.inbound_done = true;
        if let Some(inbound) = &mut self.inbound {
            inbound.finish();
        }
    }

    pub(crate) fn fail_inbound(&mut self, e: ParseError) {
        self.inbound_done = true;
        if let Some(inbound) = &mut self.inbound {
            inbound.fail(e);
        }
    }
}

impl std::fmt::Debug for WebSocketOperations {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketOperations")
            .field("id", &self.id)
            .field("protocol", &self.protocol)
            .field("plain_text", &self.plain_text)
            .field("inbound_done", &self.inbound_done)
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}

/// The executor state a bridge may touch while it handles one signal.
pub(crate) struct Context<'a> {
    pub(crate) stream: u64,
    pub(crate) channel: &'a mut Channel,
    pub(crate) deferred: &'a mut VecDeque<Deferred>,
    pub(crate) listeners: &'a mut Listeners,
    pub(crate) peer_closed: bool,
}

impl Context<'_> {
    fn listen(&mut self, handle: WriteHandle, listen: Listen) {
        let stream = self.stream;
        self.listeners.push(async move { Listened::Bridge { stream, listen, result: handle.await } }.boxed());
    }

    fn execute(&mut self, terminated: Terminated) {
        self.deferred.push_back(Deferred { stream: self.stream, terminated });
    }
}

/// Body units of an HTTP response.
pub(crate) struct HttpOutbound<'a> {
    pub(crate) ctx: Context<'a>,
    pub(crate) ops: &'a mut HttpServerOperations,
}

impl Outbound for HttpOutbound<'_> {
    fn is_open(&self) -> bool {
        self.ctx.channel.is_open()
    }

    fn send_next(&mut self, unit: Unit) -> Result<Option<WriteHandle>, HttpError> {
        let bytes = match unit {
            Unit::Binary(bytes) => bytes,
            Unit::Text(text) => Bytes::from(text),
            Unit::Frame(_) => return Err(HttpError::invalid_argument("websocket frame written to an http response")),
        };

        let mut handle = self.ops.send_headers(self.ctx.channel, self.ctx.peer_closed)?;
        if !bytes.is_empty() {
            handle = self.ops.send_payload(self.ctx.channel, PayloadItem::Chunk(bytes))?;
        }
        if handle.is_some() {
            self.ops.last_write.clone_from(&handle);
        }
        Ok(handle)
    }

    fn flush(&mut self) {
        self.ctx.channel.flush();
    }

    fn listen(&mut self, handle: WriteHandle, listen: Listen) {
        self.ctx.listen(handle, listen);
    }

    fn on_inactive(&mut self) -> Cancellation {
        self.ctx.channel.on_inactive()
    }

    fn execute(&mut self, terminated: Terminated) {
        self.ctx.execute(terminated);
    }
}

/// Frames of a WebSocket session.
pub(crate) struct WsOutbound<'a> {
    pub(crate) ctx: Context<'a>,
    pub(crate) ops: &'a mut WebSocketOperations,
}

impl Outbound for WsOutbound<'_> {
    fn is_open(&self) -> bool {
        self.ctx.channel.is_open()
    }

    fn send_next(&mut self, unit: Unit) -> Result<Option<WriteHandle>, HttpError> {
        let frame = match unit {
            Unit::Binary(bytes) if self.ops.plain_text => Frame::text(bytes),
            Unit::Binary(bytes) => Frame::binary(bytes),
            Unit::Text(text) => Frame::text(text),
            Unit::Frame(frame) => frame,
        };
        Ok(self.ops.send_frame(self.ctx.channel, frame)?)
    }

    fn flush(&mut self) {
        self.ctx.channel.flush();
    }

    fn listen(&mut self, handle: WriteHandle, listen: Listen) {
        self.ctx.listen(handle, listen);
    }

    fn on_inactive(&mut self) -> Cancellation {
        self.ctx.channel.on_inactive()
    }

    fn execute(&mut self, terminated: Terminated) {
        self.ctx.execute(terminated);
    }
}

/// Creates the mailbox of a connection.
pub(crate) fn mailbox() -> (UnboundedSender<Event>, mpsc::UnboundedReceiver<Event>) {
    mpsc::unbounded()
}
