use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::channel::mpsc;
use futures::{Stream, StreamExt};
use http::HeaderMap;

use crate::codec::{Frame, OpCode};
use crate::protocol::{BoxError, ParseError, RequestHeader};
use crate::reactive::{BoxSource, Unit, from_stream};

type FrameItem = Result<Frame, ParseError>;

/// Frames received on an upgraded connection.
///
/// Close frames end the stream and pings are answered by the connection, so the stream carries
/// data frames and pongs. A protocol error ends it with an error.
#[derive(Debug)]
pub struct WebSocketInbound {
    receiver: mpsc::Receiver<FrameItem>,
    header: Arc<RequestHeader>,
    protocol: Option<String>,
}

impl WebSocketInbound {
    pub(crate) fn new(receiver: mpsc::Receiver<FrameItem>, header: Arc<RequestHeader>, protocol: Option<String>) -> Self {
        Self { receiver, header, protocol }
    }

    /// Headers of the handshake request.
    pub fn headers(&self) -> &HeaderMap {
        self.header.headers()
    }

    pub fn selected_protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    /// Only the payloads of text frames, as strings.
    pub fn receive_text(self) -> impl Stream<Item = Result<String, ParseError>> + Send + 'static {
        self.filter_map(|frame| async move {
            match frame {
                Ok(frame) if frame.opcode() == OpCode::Text => {
                    Some(String::from_utf8(frame.into_payload().to_vec()).map_err(ParseError::invalid_frame))
                }
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            }
        })
    }
}

impl Stream for WebSocketInbound {
    type Item = FrameItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_next_unpin(cx)
    }
}

/// The sending side of an upgraded connection.
#[derive(Debug, Clone)]
pub struct WebSocketOutbound {
    protocol: Option<String>,
    plain_text: bool,
}

impl WebSocketOutbound {
    pub(crate) fn new(protocol: Option<String>, plain_text: bool) -> Self {
        Self { protocol, plain_text }
    }

    pub fn selected_protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    /// Whether byte units go out as text frames.
    pub fn is_plain_text(&self) -> bool {
        self.plain_text
    }

    /// Turns a stream of units into the source the session returns.
    pub fn send<S, U, E>(&self, units: S) -> BoxSource<Unit>
    where
        S: Stream<Item = Result<U, E>> + Send + 'static,
        U: Into<Unit> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        from_stream(units.map(|unit| unit.map(Into::into)))
    }
}
