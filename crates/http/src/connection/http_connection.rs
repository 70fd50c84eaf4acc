use std::collections::VecDeque;
use std::fmt;
use std::future::poll_fn;
use std::mem;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use bytes::Bytes;
use futures::channel::mpsc::UnboundedSender;
use futures::{FutureExt, StreamExt};
use http::{HeaderValue, StatusCode, header};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Encoder, FramedRead};
use tracing::{debug, error, info, trace, warn};

use crate::bridge::{FlushBridge, Outbound, Terminated};
use crate::codec::websocket::{CLOSE_INTERNAL_ERROR, CLOSE_MESSAGE_TOO_BIG, CLOSE_NORMAL, CLOSE_PROTOCOL_ERROR};
use crate::codec::{Frame, FrameCodec, Inbound, OpCode, ResponseEncoder, ServerDecoder};
use crate::config::ServerConfig;
use crate::connection::channel::Channel;
use crate::connection::handshake::{self, WS_VERSION};
use crate::connection::operations::{
    Context, Deferred, Event, HttpOutbound, HttpServerOperations, Listened, Listeners, MailboxSubscriber, Operations,
    WebSocketOperations, WsOutbound, mailbox, settle,
};
use crate::connection::writer::FlushWriter;
use crate::handler::{Handler, HttpServerRequest, HttpServerResponse, Reply, WebSocketInbound, WebSocketOutbound, WebSocketUpgrade};
use crate::protocol::body::{ReqBody, body_channel, inbound_channel};
use crate::protocol::{HttpError, Message, ParseError, PayloadItem, PayloadSize, RequestHeader, ResponseHead, SendError};
use crate::reactive::{BoxSource, Unit};

/// An HTTP/1.x connection that serves requests one exchange at a time.
///
/// `HttpConnection` owns both halves of the socket and runs everything on the task that awaits
/// [`HttpConnection::process`]:
/// - Reading and decoding requests, with back-pressure from the request body consumer
/// - Invoking the handler and subscribing the outbound source it returns
/// - Writing the response through flush batches, in order
/// - Keep-alive, `100-continue`, and the upgrade to WebSocket
///
/// Outbound sources run on their own tasks and only post signals to the connection mailbox, so
/// all connection state is touched from a single task.
///
/// # Type Parameters
///
/// * `R`: The async readable stream type
/// * `W`: The async writable stream type
pub struct HttpConnection<R, W> {
    framed_read: FramedRead<R, ServerDecoder>,
    writer: FlushWriter<W>,
    config: ServerConfig,
}

impl<R, W> fmt::Debug for HttpConnection<R, W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpConnection").field("config", &self.config).finish_non_exhaustive()
    }
}

impl<R, W> HttpConnection<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self::with_config(reader, writer, ServerConfig::default())
    }

    pub fn with_config(reader: R, writer: W, config: ServerConfig) -> Self {
        Self {
            framed_read: FramedRead::with_capacity(reader, ServerDecoder::new(), config.get_read_buffer_size()),
            writer: FlushWriter::new(writer),
            config,
        }
    }

    /// Serves the connection until it closes.
    ///
    /// Returns an error when the connection ended because of a malformed request or a failed
    /// write; a peer that simply goes away is not an error.
    pub async fn process<H>(self, handler: Arc<H>) -> Result<(), HttpError>
    where
        H: Handler + ?Sized,
    {
        let Self { mut framed_read, mut writer, config } = self;
        let (mailbox, mut inbox) = mailbox();
        let mut executor = Executor::new(handler, config, mailbox);

        loop {
            if executor.channel.is_drained() && writer.is_idle() {
                break;
            }

            let writing = executor.channel.has_batches() || !writer.is_idle();
            let listening = !executor.listeners.is_empty();
            let parked = executor.ops.as_ref().is_some_and(Operations::has_parked);
            let reading = !parked && executor.wants_read();

            tokio::select! {
                biased;
                result = poll_fn(|cx| writer.poll_drive(cx, &mut executor.channel)), if writing => {
                    if let Err(e) = result {
                        executor.on_write_failure(e);
                    }
                }
                Some(listened) = executor.listeners.next(), if listening => executor.on_listened(listened),
                Some(event) = inbox.next() => executor.on_event(event),
                () = poll_fn(|cx| poll_parked(&mut executor.ops, cx)), if parked => {}
                item = framed_read.next(), if reading => executor.on_read(item),
            }

            executor.run_deferred();
            executor.resume_pipelined();
            if mem::take(&mut executor.pending_upgrade) {
                debug!("switch connection decoder to websocket frames");
                framed_read.decoder_mut().upgrade(executor.config.get_max_frame_size());
            }
        }

        executor.close(SendError::Closed);
        while let Some(listened) = executor.listeners.next().await {
            trace!(?listened, "write outcome after close");
        }
        if let Err(e) = writer.shutdown().await {
            debug!(cause = %e, "shutdown connection writer failed");
        }

        info!("connection closed");
        executor.failure.map_or(Ok(()), Err)
    }
}

/// Pushes a parked inbound item once its consumer made room.
fn poll_parked(ops: &mut Option<Operations>, cx: &mut TaskContext<'_>) -> Poll<()> {
    match ops {
        Some(Operations::Http(ops)) => ops.body.as_mut().map_or(Poll::Ready(()), |body| body.poll_flush(cx)),
        Some(Operations::WebSocket(ops)) => ops.inbound.as_mut().map_or(Poll::Ready(()), |inbound| inbound.poll_flush(cx)),
        None => Poll::Ready(()),
    }
}

/// A head with an empty body that closes the connection.
fn error_head(status: StatusCode) -> ResponseHead {
    let mut head = ResponseHead::default();
    *head.status_mut() = status;
    head.headers_mut().insert(header::CONNECTION, HeaderValue::from_static("close"));
    head
}

/// Connection state, driven by one event at a time.
struct Executor<H: ?Sized> {
    handler: Arc<H>,
    config: ServerConfig,
    mailbox: UnboundedSender<Event>,
    channel: Channel,
    ops: Option<Operations>,
    deferred: VecDeque<Deferred>,
    listeners: Listeners,
    next_stream: u64,
    peer_closed: bool,
    pending_upgrade: bool,
    /// A request read ahead while the previous response was still being written.
    pipelined: Option<Result<Inbound, ParseError>>,
    failure: Option<HttpError>,
}

impl<H> Executor<H>
where
    H: Handler + ?Sized,
{
    fn new(handler: Arc<H>, config: ServerConfig, mailbox: UnboundedSender<Event>) -> Self {
        Self {
            handler,
            config,
            mailbox,
            channel: Channel::new(),
            ops: None,
            deferred: VecDeque::new(),
            listeners: Listeners::new(),
            next_stream: 0,
            peer_closed: false,
            pending_upgrade: false,
            pipelined: None,
            failure: None,
        }
    }

    fn next_stream(&mut self) -> u64 {
        self.next_stream += 1;
        self.next_stream
    }

    fn current_stream(&self) -> Option<u64> {
        self.ops.as_ref().map(Operations::id)
    }

    /// The socket stays polled while a response is outstanding so a peer close is seen.
    fn wants_read(&self) -> bool {
        if self.peer_closed || !self.channel.is_open() || self.pipelined.is_some() {
            return false;
        }
        match &self.ops {
            None | Some(Operations::Http(_)) => true,
            Some(Operations::WebSocket(ops)) => ops.started,
        }
    }

    fn is_inbound_done(&self) -> bool {
        match &self.ops {
            Some(Operations::Http(ops)) => ops.inbound_done,
            Some(Operations::WebSocket(ops)) => ops.inbound_done,
            None => false,
        }
    }

    fn on_read(&mut self, item: Option<Result<Inbound, ParseError>>) {
        if self.is_inbound_done() {
            self.on_read_ahead(item);
            return;
        }

        match item {
            Some(Ok(Inbound::Http(Message::Header((header, payload_size))))) => self.on_request(header, payload_size),
            Some(Ok(Inbound::Http(Message::Payload(item)))) => self.on_content(item),
            Some(Ok(Inbound::Frame(frame))) => self.on_frame(frame),
            Some(Err(e)) => self.on_decode_error(e),
            None => self.on_read_closed(),
        }
    }

    /// Input that arrives while only the response of the current exchange is left.
    fn on_read_ahead(&mut self, item: Option<Result<Inbound, ParseError>>) {
        match item {
            None => self.on_read_closed(),
            Some(Err(ParseError::Io { source })) => {
                debug!(cause = %source, "read failed while a response is outstanding");
                self.on_read_closed();
            }
            Some(item) if matches!(self.ops, Some(Operations::Http(_))) => {
                trace!("hold pipelined request until the current response is released");
                self.pipelined = Some(item);
            }
            Some(item) => trace!(?item, "drop input after the close frame"),
        }
    }

    fn resume_pipelined(&mut self) {
        if self.ops.is_some() || self.pipelined.is_none() {
            return;
        }
        if !self.channel.is_open() {
            trace!("connection closing, drop pipelined request");
            self.pipelined = None;
            return;
        }
        let item = self.pipelined.take();
        self.on_read(item);
    }

    fn on_request(&mut self, header: RequestHeader, payload_size: PayloadSize) {
        let stream = self.next_stream();
        info!(stream, method = %header.method(), uri = %header.uri(), "receive request");
        let mut ops = HttpServerOperations::new(stream, header, self.config.is_date_header());

        if ops.header.expects_continue() && !payload_size.is_empty() {
            let mut head = ResponseHead::default();
            *head.status_mut() = StatusCode::CONTINUE;
            match ops.send_head(&mut self.channel, head, PayloadSize::Empty) {
                Ok(_) => {
                    self.channel.flush();
                    info!("receive expect request header, sent continue response");
                }
                Err(e) => warn!(cause = %e, "can't send continue response"),
            }
        }

        let body = if payload_size.is_empty() {
            ops.inbound_done = true;
            ReqBody::empty()
        } else if ops.header.is_websocket() {
            debug!(stream, ?payload_size, "aggregate websocket handshake body");
            ops.aggregate = Some(Default::default());
            self.ops = Some(Operations::Http(ops));
            return;
        } else {
            let (sender, body) = body_channel(payload_size, self.config.get_body_channel_depth());
            ops.body = Some(sender);
            body
        };

        self.ops = Some(Operations::Http(ops));
        self.invoke_handler(body);
    }

    fn on_content(&mut self, item: PayloadItem) {
        let Some(Operations::Http(ops)) = &mut self.ops else {
            warn!("request payload without a request");
            return;
        };

        match item {
            PayloadItem::Chunk(bytes) => {
                let max = self.config.get_max_frame_size();
                if ops.aggregate.as_ref().is_some_and(|aggregate| aggregate.len() + bytes.len() > max) {
                    self.on_decode_error(ParseError::too_large_body(max));
                    return;
                }

                if let Some(aggregate) = &mut ops.aggregate {
                    aggregate.extend_from_slice(&bytes);
                } else if let Some(body) = &mut ops.body {
                    if !bytes.is_empty() {
                        body.offer(Ok(bytes));
                    }
                }
            }

            PayloadItem::Eof => {
                ops.inbound_done = true;
                trace!(stream = ops.id, "request body complete");
                if let Some(body) = &mut ops.body {
                    body.finish();
                }

                if let Some(aggregate) = ops.aggregate.take() {
                    let (mut sender, body) = body_channel(PayloadSize::new_length(aggregate.len() as u64), 1);
                    if !aggregate.is_empty() {
                        sender.offer(Ok(aggregate.freeze()));
                    }
                    sender.finish();
                    self.invoke_handler(body);
                } else if ops.outbound_done {
                    self.release();
                }
            }
        }
    }

    fn on_frame(&mut self, frame: Frame) {
        let Some(Operations::WebSocket(ops)) = &mut self.ops else {
            warn!("websocket frame without a session");
            return;
        };
        if ops.inbound_done {
            trace!(stream = ops.id, opcode = ?frame.opcode(), "drop frame after the close frame");
            return;
        }

        match frame.opcode() {
            OpCode::Close => {
                debug!(stream = ops.id, code = ?frame.close_code(), "receive close frame");
                ops.finish_inbound();
            }
            OpCode::Ping => {
                trace!(stream = ops.id, "receive ping, reply pong");
                match ops.send_frame(&mut self.channel, Frame::pong(frame.into_payload())) {
                    Ok(_) => self.channel.flush(),
                    Err(e) => debug!(cause = %e, "can't reply pong"),
                }
            }
            _ => {
                if let Some(inbound) = &mut ops.inbound {
                    inbound.offer(Ok(frame));
                }
            }
        }
    }

    fn on_decode_error(&mut self, e: ParseError) {
        let too_large = matches!(e, ParseError::TooLargeBody { .. });
        match &mut self.ops {
            Some(Operations::WebSocket(ops)) => {
                error!(cause = %e, "invalid websocket frame, close connection");
                ops.fail_inbound(ParseError::invalid_frame(&e));
                let code = if too_large { CLOSE_MESSAGE_TOO_BIG } else { CLOSE_PROTOCOL_ERROR };
                if let Err(write_error) = ops.send_frame(&mut self.channel, Frame::close(code, "")) {
                    debug!(cause = %write_error, "can't send close frame");
                }
            }
            Some(Operations::Http(ops)) => {
                error!(cause = %e, "can't decode request body");
                if let Some(body) = &mut ops.body {
                    body.fail(ParseError::invalid_body(&e));
                }
                ops.aggregate = None;
                ops.inbound_done = true;
                let written = if ops.response.mark_headers_sent() {
                    let status = if too_large { StatusCode::PAYLOAD_TOO_LARGE } else { StatusCode::BAD_REQUEST };
                    ops.send_head(&mut self.channel, error_head(status), PayloadSize::Empty)
                } else {
                    ops.send_payload(&mut self.channel, PayloadItem::Eof)
                };
                if let Err(write_error) = written {
                    debug!(cause = %write_error, "can't send error response");
                }
            }
            None => {
                error!(cause = %e, "can't decode request head");
                let mut encoder = ResponseEncoder::new();
                let head = error_head(StatusCode::BAD_REQUEST);
                if let Err(write_error) =
                    self.channel.write(|dst| encoder.encode(Message::<_, Bytes>::Header((head, PayloadSize::Empty)), dst))
                {
                    debug!(cause = %write_error, "can't send error response");
                }
            }
        }

        self.channel.close_after_flush();
        self.failure = Some(e.into());
    }

    fn on_read_closed(&mut self) {
        self.peer_closed = true;
        match &mut self.ops {
            None => {
                debug!("peer closed an idle connection");
                self.channel.close_after_flush();
            }
            Some(Operations::Http(ops)) if !ops.inbound_done && ops.outbound_done => {
                debug!(stream = ops.id, "peer closed while the rest of the request was discarded");
                ops.inbound_done = true;
                self.release();
            }
            Some(ops) => {
                debug!(stream = ops.id(), "peer closed with an exchange in flight, cancel it");
                self.close(SendError::Closed);
            }
        }
    }

    fn on_write_failure(&mut self, e: SendError) {
        if e.is_remote_closed() {
            debug!(cause = %e, "peer went away while writing");
        } else {
            error!(cause = %e, "write to the connection failed");
            self.failure = Some(e.clone().into());
        }
        self.close(e);
    }

    /// Closes the channel, notifies the live bridge and fails whatever still waits for input.
    fn close(&mut self, cause: SendError) {
        if self.channel.close(cause) {
            if let Some(bridge) = self.ops.as_mut().and_then(Operations::bridge_mut) {
                bridge.on_inactive();
            }
        }

        match self.ops.take() {
            Some(Operations::Http(mut ops)) => {
                if !ops.inbound_done {
                    if let Some(body) = &mut ops.body {
                        body.fail(ParseError::invalid_body("connection closed before the request body ended"));
                    }
                }
                ops.promise.try_failure(HttpError::RemoteClosed);
            }
            Some(Operations::WebSocket(mut ops)) => {
                if !ops.inbound_done {
                    ops.fail_inbound(ParseError::invalid_frame("connection closed without a close frame"));
                }
                ops.promise.try_failure(HttpError::RemoteClosed);
            }
            None => {}
        }
    }

    fn invoke_handler(&mut self, body: ReqBody) {
        let Some(Operations::Http(ops)) = &mut self.ops else {
            return;
        };

        let stream = ops.id;
        let request = HttpServerRequest::new(Arc::clone(&ops.header), Arc::clone(&ops.cookies), body);
        let reply = {
            let mut response = HttpServerResponse::new(&mut ops.response, &mut ops.promise);
            self.handler.call(request, &mut response)
        };
        trace!(stream, ?reply, "handler returned");

        match reply {
            Reply::Body(source) => self.subscribe(stream, source),
            Reply::Headers => self.terminate(stream, None),
            Reply::Error(e) => self.terminate(stream, Some(e)),
            Reply::WebSocket(upgrade) => self.upgrade(stream, upgrade),
        }
    }

    /// Ends an exchange that has no outbound source.
    fn terminate(&mut self, stream: u64, error: Option<HttpError>) {
        let Some(Operations::Http(ops)) = &mut self.ops else {
            return;
        };
        let promise = mem::take(&mut ops.promise);
        self.deferred.push_back(Deferred { stream, terminated: Terminated { promise, last_write: None, error } });
    }

    fn subscribe(&mut self, stream: u64, source: BoxSource<Unit>) {
        match &mut self.ops {
            Some(Operations::Http(ops)) => {
                ops.bridge = Some(FlushBridge::new(ops.response.is_flush_each(), mem::take(&mut ops.promise)));
            }
            // frames are interactive, every one of them is flushed
            Some(Operations::WebSocket(ops)) => {
                ops.bridge = Some(FlushBridge::new(true, mem::take(&mut ops.promise)));
            }
            None => return,
        }
        debug!(stream, "subscribe outbound source");
        source.subscribe(Box::new(MailboxSubscriber::new(stream, self.mailbox.clone())));
    }

    fn on_event(&mut self, event: Event) {
        let stream = event.stream();
        if self.current_stream() != Some(stream) {
            if let Event::Subscribe { subscription, .. } = event {
                debug!(stream, "source of a finished exchange subscribed, cancel it");
                subscription.cancel();
            } else {
                trace!(stream, "drop signal of a finished exchange");
            }
            return;
        }

        self.with_bridge(stream, |bridge, out| match event {
            Event::Subscribe { subscription, .. } => bridge.on_subscribe(out, subscription),
            Event::Next { unit, .. } => match bridge.on_next(out, unit) {
                Ok(()) => {}
                Err(e @ HttpError::InvalidArgument { .. }) => {
                    error!(cause = %e, "outbound source broke the contract");
                    bridge.abort(out, e);
                }
                Err(e) => debug!(cause = %e, "drop outbound unit"),
            },
            Event::Error { error, .. } => {
                if let Err(e) = bridge.on_error(out, HttpError::handler(error)) {
                    debug!(cause = %e, "drop outbound error");
                }
            }
            Event::Complete { .. } => bridge.on_complete(out),
        });
    }

    /// Runs `f` with the bridge of the current exchange and the matching outbound view.
    fn with_bridge<F>(&mut self, stream: u64, f: F)
    where
        F: FnOnce(&mut FlushBridge, &mut dyn Outbound),
    {
        let Self { ops, channel, deferred, listeners, peer_closed, .. } = self;
        let ctx = Context { stream, channel, deferred, listeners, peer_closed: *peer_closed };

        match ops {
            Some(Operations::Http(ops)) => {
                let Some(mut bridge) = ops.bridge.take() else {
                    return;
                };
                f(&mut bridge, &mut HttpOutbound { ctx, ops: &mut *ops });
                ops.bridge = Some(bridge);
            }
            Some(Operations::WebSocket(ops)) => {
                let Some(mut bridge) = ops.bridge.take() else {
                    return;
                };
                f(&mut bridge, &mut WsOutbound { ctx, ops: &mut *ops });
                ops.bridge = Some(bridge);
            }
            None => {}
        }
    }

    fn on_listened(&mut self, listened: Listened) {
        match listened {
            Listened::Bridge { stream, listen, result } => {
                if self.current_stream() != Some(stream) {
                    return;
                }
                if let Some(bridge) = self.ops.as_mut().and_then(Operations::bridge_mut) {
                    bridge.on_write_complete(listen, result);
                }
            }
            Listened::Upgraded { stream, result } => self.on_upgraded(stream, result),
            Listened::Settled => {}
        }
    }

    fn run_deferred(&mut self) {
        while let Some(Deferred { stream, terminated }) = self.deferred.pop_front() {
            if self.current_stream() != Some(stream) {
                debug!(stream, "termination of a finished exchange");
                continue;
            }
            if matches!(self.ops, Some(Operations::WebSocket(_))) {
                self.on_websocket_terminated(terminated);
            } else {
                self.on_http_terminated(terminated);
            }
        }
    }

    fn on_http_terminated(&mut self, terminated: Terminated) {
        let Some(Operations::Http(ops)) = &mut self.ops else {
            return;
        };
        let Terminated { promise, last_write, error } = terminated;
        ops.bridge = None;
        ops.promise = promise;
        if last_write.is_some() {
            ops.last_write = last_write;
        }

        if let Some(e) = error {
            self.on_http_outbound_error(e);
            return;
        }

        ops.outbound_done = true;
        if ops.inbound_done {
            self.release();
        } else {
            debug!(stream = ops.id, "response done before the request, discard the rest of the request body");
            if let Some(body) = &mut ops.body {
                body.discard();
            }
        }
    }

    /// Finishes the response of the current exchange and frees the connection for the next one.
    fn release(&mut self) {
        let Some(Operations::Http(ops)) = &mut self.ops else {
            return;
        };

        let written = if !ops.response.is_headers_sent() {
            let framing = ops.response.payload_size(ops.header.version());
            if !framing.is_chunked() && !ops.response.is_content_length_set() {
                if let Err(e) = ops.response.set_content_length(0) {
                    warn!(cause = %e, "can't set empty content length");
                }
            }
            ops.send_headers(&mut self.channel, self.peer_closed)
                .and_then(|head| Ok(ops.send_payload(&mut self.channel, PayloadItem::Eof)?.or(head)))
        } else if !ops.response.is_content_length_set() {
            ops.send_payload(&mut self.channel, PayloadItem::Eof)
        } else {
            Ok(None)
        };
        self.channel.flush();

        let stream = ops.id;
        let keep_alive = ops.keep_alive && !self.peer_closed;
        let promise = mem::take(&mut ops.promise);
        match written {
            Ok(handle) => settle(&mut self.listeners, handle.or_else(|| ops.last_write.take()), promise),
            Err(e) => {
                error!(cause = %e, "can't finish the response");
                let mut promise = promise;
                promise.try_failure(e.into());
                self.channel.close_after_flush();
            }
        }

        self.ops = None;
        if keep_alive {
            debug!(stream, "response released, wait for the next request");
        } else {
            debug!(stream, "response released, close connection");
            self.channel.close_after_flush();
        }
    }

    fn on_http_outbound_error(&mut self, e: HttpError) {
        let Some(Operations::Http(ops)) = &mut self.ops else {
            return;
        };
        let mut promise = mem::take(&mut ops.promise);
        if let Some(body) = &mut ops.body {
            body.discard();
        }

        if e.is_remote_closed() {
            debug!(cause = %e, stream = ops.id, "peer closed the connection during the response");
        } else {
            let written = if ops.response.mark_headers_sent() {
                error!(cause = %e, stream = ops.id, "error before the response started, reply 500");
                ops.send_head(&mut self.channel, error_head(StatusCode::INTERNAL_SERVER_ERROR), PayloadSize::Empty)
            } else if ops.response.is_content_length_set() {
                error!(cause = %e, stream = ops.id, "error in the middle of a fixed length response, close connection");
                Ok(None)
            } else {
                error!(cause = %e, stream = ops.id, "error in the middle of the response, end the body and close connection");
                ops.send_payload(&mut self.channel, PayloadItem::Eof)
            };
            if let Err(write_error) = written {
                debug!(cause = %write_error, "can't end the failed response");
            }
        }

        self.ops = None;
        self.channel.close_after_flush();
        promise.try_failure(e);
    }

    fn upgrade(&mut self, stream: u64, upgrade: WebSocketUpgrade) {
        let session = self.next_stream();
        let Some(Operations::Http(ops)) = &mut self.ops else {
            return;
        };

        let accepted = handshake::handshake(&ops.header, upgrade.protocols.as_deref())
            .and_then(|handshake| Ok((handshake::switching_protocols(&handshake)?, handshake)));
        let (head, handshake) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(cause = %e, stream, "websocket handshake failed");
                ops.response.mark_headers_sent();
                ops.keep_alive = ops.header.is_keep_alive() && !self.peer_closed;

                let mut head = ResponseHead::default();
                *head.status_mut() = StatusCode::UPGRADE_REQUIRED;
                head.headers_mut().insert(header::SEC_WEBSOCKET_VERSION, HeaderValue::from_static(WS_VERSION));
                if !ops.keep_alive {
                    head.headers_mut().insert(header::CONNECTION, HeaderValue::from_static("close"));
                }
                match ops.send_head(&mut self.channel, head, PayloadSize::Empty) {
                    Ok(handle) => ops.last_write = handle,
                    Err(write_error) => debug!(cause = %write_error, "can't send upgrade required response"),
                }
                ops.promise.try_failure(e);
                self.terminate(stream, None);
                return;
            }
        };

        ops.response.mark_headers_sent();
        let written = ops.send_head(&mut self.channel, head, PayloadSize::Empty);
        self.channel.flush();

        let mut ws = WebSocketOperations {
            id: session,
            header: Arc::clone(&ops.header),
            codec: FrameCodec::new(self.config.get_max_frame_size()),
            plain_text: upgrade.plain_text,
            protocol: handshake.protocol,
            handler: Some(upgrade.handler),
            promise: mem::take(&mut ops.promise),
            bridge: None,
            inbound: None,
            inbound_done: false,
            started: false,
        };

        match written {
            Ok(Some(handle)) => {
                self.listeners.push(async move { Listened::Upgraded { stream: session, result: handle.await } }.boxed());
            }
            Ok(None) => {}
            Err(e) => {
                error!(cause = %e, "can't send the websocket handshake response");
                ws.promise.try_failure(e.into());
                self.channel.close_after_flush();
            }
        }

        // the exchange may have been replaced while the handler ran
        if !self.swap_operations(stream, Operations::WebSocket(ws)) {
            warn!(stream, "exchange replaced before the upgrade, drop the websocket session");
        }
    }

    /// Replaces the current exchange only if it is still `expected`.
    fn swap_operations(&mut self, expected: u64, ops: Operations) -> bool {
        if self.current_stream() != Some(expected) {
            return false;
        }
        self.ops = Some(ops);
        true
    }

    fn on_upgraded(&mut self, stream: u64, result: Result<(), SendError>) {
        let Some(Operations::WebSocket(ops)) = &mut self.ops else {
            return;
        };
        if ops.id != stream {
            return;
        }

        if let Err(e) = result {
            error!(cause = %e, "can't write the websocket handshake response");
            ops.promise.try_failure(e.into());
            self.channel.close_after_flush();
            return;
        }

        info!(stream, protocol = ?ops.protocol, "connection upgraded to websocket");
        self.pending_upgrade = true;
        ops.started = true;

        let (sender, receiver) = inbound_channel(self.config.get_body_channel_depth());
        ops.inbound = Some(sender);
        let inbound = WebSocketInbound::new(receiver, Arc::clone(&ops.header), ops.protocol.clone());
        let outbound = WebSocketOutbound::new(ops.protocol.clone(), ops.plain_text);
        let Some(handler) = ops.handler.take() else {
            return;
        };

        let source = handler.call(inbound, outbound);
        self.subscribe(stream, source);
    }

    fn on_websocket_terminated(&mut self, terminated: Terminated) {
        let Some(Operations::WebSocket(ops)) = &mut self.ops else {
            return;
        };
        let Terminated { mut promise, error, .. } = terminated;
        ops.bridge = None;
        ops.finish_inbound();

        let code = match &error {
            None => CLOSE_NORMAL,
            Some(e) if e.is_remote_closed() => {
                debug!(cause = %e, stream = ops.id, "peer closed the websocket");
                self.channel.close_after_flush();
                promise.try_failure(HttpError::RemoteClosed);
                return;
            }
            Some(e) => {
                error!(cause = %e, stream = ops.id, "websocket session failed");
                CLOSE_INTERNAL_ERROR
            }
        };

        debug!(stream = ops.id, code, "send close frame");
        let written = ops.send_frame(&mut self.channel, Frame::close(code, ""));
        self.channel.close_after_flush();
        match (error, written) {
            (Some(e), _) => {
                promise.try_failure(e);
            }
            (None, Ok(handle)) => settle(&mut self.listeners, handle, promise),
            (None, Err(e)) => {
                promise.try_failure(e.into());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::make_handler;
    use crate::protocol::BoxError;
    use crate::reactive::{from_iter, from_stream, just};
    use futures::channel::oneshot;
    use futures::{TryStreamExt, stream};
    use indoc::indoc;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::task::JoinHandle;
    use tokio::time::{sleep, timeout};

    fn serve<H: Handler + 'static>(handler: H) -> (DuplexStream, JoinHandle<Result<(), HttpError>>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(server);
        let config = ServerConfig::default().date_header(false);
        let connection = HttpConnection::with_config(reader, writer, config);
        (client, tokio::spawn(connection.process(Arc::new(handler))))
    }

    async fn read_until(client: &mut DuplexStream, end: &[u8]) -> String {
        let mut received = Vec::new();
        while !received.ends_with(end) {
            received.push(client.read_u8().await.unwrap());
        }
        String::from_utf8(received).unwrap()
    }

    async fn read_head(client: &mut DuplexStream) -> String {
        read_until(client, b"\r\n\r\n").await
    }

    /// Reads one unmasked server frame with a short payload.
    async fn read_frame(client: &mut DuplexStream) -> (u8, Vec<u8>) {
        let mut head = [0u8; 2];
        client.read_exact(&mut head).await.unwrap();
        let mut payload = vec![0u8; usize::from(head[1] & 0x7F)];
        client.read_exact(&mut payload).await.unwrap();
        (head[0], payload)
    }

    async fn finish_raw(mut client: DuplexStream, server: JoinHandle<Result<(), HttpError>>) -> (Vec<u8>, Result<(), HttpError>) {
        client.shutdown().await.unwrap();
        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        (received, server.await.unwrap())
    }

    async fn finish(client: DuplexStream, server: JoinHandle<Result<(), HttpError>>) -> (String, Result<(), HttpError>) {
        let (received, result) = finish_raw(client, server).await;
        (String::from_utf8(received).unwrap(), result)
    }

    fn masked(opcode: u8, payload: &[u8]) -> Vec<u8> {
        let mask = [0x12, 0x34, 0x56, 0x78];
        let mut frame = vec![0x80 | opcode, 0x80 | payload.len() as u8];
        frame.extend_from_slice(&mask);
        frame.extend(payload.iter().enumerate().map(|(i, byte)| byte ^ mask[i % 4]));
        frame
    }

    #[tokio::test]
    async fn keep_alive_serves_requests_in_order() {
        let handler = make_handler(|request: HttpServerRequest, response: &mut HttpServerResponse<'_>| {
            response.send_stream(just(Unit::from(request.uri().path().to_owned())))
        });
        let (mut client, server) = serve(handler);

        client.write_all(b"GET /first HTTP/1.1\r\nHost: a\r\n\r\nGET /second HTTP/1.1\r\nHost: a\r\n\r\n").await.unwrap();
        let received = read_until(&mut client, b"/second\r\n0\r\n\r\n").await;
        let (rest, result) = finish(client, server).await;

        let expected = indoc! {"
            HTTP/1.1 200 OK\r
            transfer-encoding: chunked\r
            \r
            6\r
            /first\r
            0\r
            \r
            HTTP/1.1 200 OK\r
            transfer-encoding: chunked\r
            \r
            7\r
            /second\r
            0\r
            \r
        "};
        assert_eq!(received, expected);
        assert_eq!(rest, "");
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn send_replies_with_empty_content_length() {
        let handler = make_handler(|_request: HttpServerRequest, response: &mut HttpServerResponse<'_>| -> Result<Reply, HttpError> {
            response.status(StatusCode::ACCEPTED)?;
            Ok(response.send())
        });
        let (mut client, server) = serve(handler);

        client.write_all(b"DELETE /item HTTP/1.1\r\nHost: a\r\n\r\n").await.unwrap();
        assert_eq!(read_head(&mut client).await, "HTTP/1.1 202 Accepted\r\ncontent-length: 0\r\n\r\n");

        let (rest, result) = finish(client, server).await;
        assert_eq!(rest, "");
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn continue_is_sent_before_the_body_is_read() {
        let handler = make_handler(|mut request: HttpServerRequest, response: &mut HttpServerResponse<'_>| {
            let body = request.receive().map_ok(Unit::Binary);
            response.send_stream(from_stream(body))
        });
        let (mut client, server) = serve(handler);

        client
            .write_all(b"POST /echo HTTP/1.1\r\nHost: a\r\nContent-Length: 5\r\nExpect: 100-continue\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(read_head(&mut client).await, "HTTP/1.1 100 Continue\r\n\r\n");

        client.write_all(b"hello").await.unwrap();
        let received = read_until(&mut client, b"\r\n0\r\n\r\n").await;
        assert!(received.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(received.ends_with("\r\n\r\n5\r\nhello\r\n0\r\n\r\n"));

        let (rest, result) = finish(client, server).await;
        assert_eq!(rest, "");
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn flush_each_writes_every_unit() {
        let handler = make_handler(|_request: HttpServerRequest, response: &mut HttpServerResponse<'_>| -> Result<Reply, HttpError> {
            response.sse()?.flush_each();
            Ok(response.send_stream(from_iter(["data: 1\n\n", "data: 2\n\n"].map(Unit::from))))
        });
        let (mut client, server) = serve(handler);

        client.write_all(b"GET /events HTTP/1.1\r\nHost: a\r\n\r\n").await.unwrap();
        let head = read_head(&mut client).await;
        assert!(head.contains("content-type: text/event-stream\r\n"));
        assert!(head.contains("transfer-encoding: chunked\r\n"));

        let received = read_until(&mut client, b"\r\n0\r\n\r\n").await;
        assert_eq!(received, "9\r\ndata: 1\n\n\r\n9\r\ndata: 2\n\n\r\n0\r\n\r\n");

        let (rest, result) = finish(client, server).await;
        assert_eq!(rest, "");
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn malformed_request_gets_bad_request() {
        let handler = make_handler(|_request: HttpServerRequest, response: &mut HttpServerResponse<'_>| response.send());
        let (mut client, server) = serve(handler);

        client.write_all(b"GET / HTTP/9.9\r\nHost: a\r\n\r\n").await.unwrap();
        let (received, result) = finish(client, server).await;

        assert!(received.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(received.contains("connection: close\r\n"));
        assert!(matches!(result, Err(HttpError::RequestError { .. })));
    }

    #[tokio::test]
    async fn handler_error_before_the_head_gets_internal_error() {
        let handler = make_handler(|_request: HttpServerRequest, _response: &mut HttpServerResponse<'_>| {
            Reply::Error(HttpError::illegal_state("boom"))
        });
        let (mut client, server) = serve(handler);

        client.write_all(b"GET / HTTP/1.1\r\nHost: a\r\n\r\nGET /never HTTP/1.1\r\nHost: a\r\n\r\n").await.unwrap();
        let (received, result) = finish(client, server).await;

        assert_eq!(received, "HTTP/1.1 500 Internal Server Error\r\nconnection: close\r\ncontent-length: 0\r\n\r\n");
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn source_error_after_the_head_ends_the_body_and_closes() {
        let handler = make_handler(|_request: HttpServerRequest, response: &mut HttpServerResponse<'_>| {
            let units = futures::stream::iter([Ok::<_, BoxError>(Unit::from("a")), Err("broken".into())]);
            response.send_stream(from_stream(units))
        });
        let (mut client, server) = serve(handler);

        client.write_all(b"GET / HTTP/1.1\r\nHost: a\r\n\r\nGET /never HTTP/1.1\r\nHost: a\r\n\r\n").await.unwrap();
        let (received, result) = finish(client, server).await;

        assert_eq!(received, "HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n1\r\na\r\n0\r\n\r\n");
        assert!(result.is_ok());
    }

    fn ws_echo() -> impl Handler {
        make_handler(|_request: HttpServerRequest, response: &mut HttpServerResponse<'_>| {
            response.upgrade_to_websocket(None, false, |inbound: WebSocketInbound, outbound: WebSocketOutbound| {
                outbound.send(inbound.receive_text().map_ok(|text| Unit::from(format!("echo {text}"))))
            })
        })
    }

    const UPGRADE: &[u8] = b"GET /ws HTTP/1.1\r\nHost: a\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Version: 13\r\n";

    #[tokio::test]
    async fn websocket_session_echoes_and_closes() {
        let (mut client, server) = serve(ws_echo());

        client.write_all(UPGRADE).await.unwrap();
        client.write_all(b"Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n").await.unwrap();
        let head = read_head(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(head.contains("sec-websocket-accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));

        client.write_all(&masked(0x9, b"hi")).await.unwrap();
        let mut pong = [0u8; 4];
        client.read_exact(&mut pong).await.unwrap();
        assert_eq!(pong, [0x8A, 0x02, b'h', b'i']);

        client.write_all(&masked(0x1, b"abc")).await.unwrap();
        let mut echo = [0u8; 10];
        client.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo[..2], &[0x81, 0x08]);
        assert_eq!(&echo[2..], b"echo abc");

        client.write_all(&masked(0x8, &CLOSE_NORMAL.to_be_bytes())).await.unwrap();
        assert_eq!(read_frame(&mut client).await, (0x88, vec![0x03, 0xE8]));

        let (rest, result) = finish_raw(client, server).await;
        assert!(rest.is_empty());
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn invalid_handshake_gets_upgrade_required() {
        let (mut client, server) = serve(ws_echo());

        client.write_all(UPGRADE).await.unwrap();
        client.write_all(b"\r\n").await.unwrap();
        let head = read_head(&mut client).await;
        assert_eq!(head, "HTTP/1.1 426 Upgrade Required\r\nsec-websocket-version: 13\r\ncontent-length: 0\r\n\r\n");

        let (rest, result) = finish(client, server).await;
        assert_eq!(rest, "");
        assert!(result.is_ok());
    }

    /// Reports when the source holding it was dropped.
    struct DropSignal(Option<oneshot::Sender<()>>);

    impl Drop for DropSignal {
        fn drop(&mut self) {
            if let Some(sender) = self.0.take() {
                let _ = sender.send(());
            }
        }
    }

    type SignalSlot = Arc<Mutex<Option<oneshot::Sender<()>>>>;

    fn drop_signal() -> (SignalSlot, oneshot::Receiver<()>) {
        let (sender, receiver) = oneshot::channel();
        (Arc::new(Mutex::new(Some(sender))), receiver)
    }

    /// A source that never emits and reports through `slot` when it is dropped.
    fn never_emits(slot: &SignalSlot) -> BoxSource<Unit> {
        let signal = DropSignal(slot.lock().unwrap().take());
        from_stream(stream::pending::<Result<Unit, BoxError>>().map(move |item| {
            let _ = &signal;
            item
        }))
    }

    #[tokio::test]
    async fn peer_close_cancels_a_pending_response() {
        let (slot, dropped) = drop_signal();
        let handler = make_handler(move |_request: HttpServerRequest, response: &mut HttpServerResponse<'_>| {
            response.send_stream(never_emits(&slot))
        });
        let (mut client, server) = serve(handler);

        client.write_all(b"GET /poll HTTP/1.1\r\nHost: a\r\n\r\n").await.unwrap();
        sleep(Duration::from_millis(50)).await;
        drop(client);

        let result = timeout(Duration::from_secs(2), server).await.unwrap().unwrap();
        assert!(result.is_ok());
        timeout(Duration::from_secs(2), dropped).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn pipelined_request_waits_for_the_pending_response() {
        let handler = make_handler(|request: HttpServerRequest, response: &mut HttpServerResponse<'_>| {
            if request.uri().path() == "/slow" {
                let delayed = stream::once(async {
                    sleep(Duration::from_millis(20)).await;
                    Ok::<_, BoxError>(Unit::from("slow"))
                });
                response.send_stream(from_stream(delayed))
            } else {
                response.send_stream(just(Unit::from("fast")))
            }
        });
        let (mut client, server) = serve(handler);

        client.write_all(b"GET /slow HTTP/1.1\r\nHost: a\r\n\r\nGET /fast HTTP/1.1\r\nHost: a\r\n\r\n").await.unwrap();
        let received = read_until(&mut client, b"fast\r\n0\r\n\r\n").await;
        let slow = received.find("slow").unwrap();
        let fast = received.find("fast").unwrap();
        assert!(slow < fast);

        let (rest, result) = finish(client, server).await;
        assert_eq!(rest, "");
        assert!(result.is_ok());
    }

    async fn handshake(client: &mut DuplexStream) {
        client.write_all(UPGRADE).await.unwrap();
        client.write_all(b"Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n").await.unwrap();
        assert!(read_head(client).await.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
    }

    #[tokio::test]
    async fn peer_close_after_the_close_frame_cancels_the_session() {
        let (slot, dropped) = drop_signal();
        let handler = make_handler(move |_request: HttpServerRequest, response: &mut HttpServerResponse<'_>| {
            let slot = Arc::clone(&slot);
            response.upgrade_to_websocket(None, false, move |_inbound: WebSocketInbound, _outbound: WebSocketOutbound| {
                never_emits(&slot)
            })
        });
        let (mut client, server) = serve(handler);

        handshake(&mut client).await;
        client.write_all(&masked(0x8, &CLOSE_NORMAL.to_be_bytes())).await.unwrap();
        sleep(Duration::from_millis(50)).await;
        drop(client);

        let result = timeout(Duration::from_secs(2), server).await.unwrap().unwrap();
        assert!(result.is_ok());
        timeout(Duration::from_secs(2), dropped).await.unwrap().unwrap();
    }

    /// Answers with one text frame listing every inbound item, once the inbound stream ended.
    fn ws_summary() -> impl Handler {
        make_handler(|_request: HttpServerRequest, response: &mut HttpServerResponse<'_>| {
            response.upgrade_to_websocket(None, false, |inbound: WebSocketInbound, _outbound: WebSocketOutbound| {
                let summary = inbound
                    .map(|item| match item {
                        Ok(frame) => format!("{:?} {}", frame.opcode(), String::from_utf8_lossy(frame.payload())),
                        Err(e) => format!("error {e}"),
                    })
                    .chain(stream::once(async { "end".to_owned() }))
                    .collect::<Vec<_>>()
                    .map(|items| Ok::<_, BoxError>(Unit::from(items.join("|"))));
                from_stream(stream::once(summary))
            })
        })
    }

    #[tokio::test]
    async fn ping_is_answered_without_reaching_the_handler() {
        let (mut client, server) = serve(ws_summary());
        handshake(&mut client).await;

        let mut frames = masked(0x1, b"abc");
        frames.extend(masked(0x9, b"hi"));
        frames.extend(masked(0x1, b"def"));
        frames.extend(masked(0x8, &CLOSE_NORMAL.to_be_bytes()));
        client.write_all(&frames).await.unwrap();

        assert_eq!(read_frame(&mut client).await, (0x8A, b"hi".to_vec()));
        assert_eq!(read_frame(&mut client).await, (0x81, b"Text abc|Text def|end".to_vec()));
        assert_eq!(read_frame(&mut client).await, (0x88, vec![0x03, 0xE8]));

        let (rest, result) = finish_raw(client, server).await;
        assert!(rest.is_empty());
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn close_frame_ends_the_inbound_stream_without_error() {
        let (mut client, server) = serve(ws_summary());
        handshake(&mut client).await;

        client.write_all(&masked(0x2, b"xyz")).await.unwrap();
        client.write_all(&masked(0x8, &CLOSE_NORMAL.to_be_bytes())).await.unwrap();

        // an inbound error would show up in the summary and close with 1011
        assert_eq!(read_frame(&mut client).await, (0x81, b"Binary xyz|end".to_vec()));
        assert_eq!(read_frame(&mut client).await, (0x88, vec![0x03, 0xE8]));

        let (rest, result) = finish_raw(client, server).await;
        assert!(rest.is_empty());
        assert!(result.is_ok());
    }
}
