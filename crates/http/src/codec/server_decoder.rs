use bytes::BytesMut;
use tokio_util::codec::Decoder;

use crate::codec::websocket::{Frame, FrameCodec};
use crate::codec::RequestDecoder;
use crate::protocol::{Message, ParseError, PayloadSize, RequestHeader};

/// What the server reads from a connection: HTTP messages, then frames after an upgrade.
#[derive(Debug)]
pub enum Inbound {
    Http(Message<(RequestHeader, PayloadSize)>),
    Frame(Frame),
}

/// Connection decoder that switches from HTTP to WebSocket framing at upgrade.
///
/// The switch happens between two reads, so bytes that follow the handshake request in the
/// buffer are decoded as frames.
#[derive(Debug)]
pub enum ServerDecoder {
    Http(RequestDecoder),
    WebSocket(FrameCodec),
}

impl ServerDecoder {
    pub fn new() -> Self {
        ServerDecoder::Http(RequestDecoder::new())
    }

    pub fn upgrade(&mut self, max_frame_size: usize) {
        *self = ServerDecoder::WebSocket(FrameCodec::new(max_frame_size));
    }

    pub fn is_websocket(&self) -> bool {
        matches!(self, ServerDecoder::WebSocket(_))
    }
}

impl Default for ServerDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for ServerDecoder {
    type Item = Inbound;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self {
            ServerDecoder::Http(decoder) => Ok(decoder.decode(src)?.map(Inbound::Http)),
            ServerDecoder::WebSocket(codec) => Ok(codec.decode(src)?.map(Inbound::Frame)),
        }
    }
}
