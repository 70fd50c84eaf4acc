//! HTTP response encoder.
//!
//! One [`ResponseEncoder`] serves one exchange: a final head selects the payload encoder, the
//! payload items that follow are framed by it. Informational heads can be written before the
//! final head and leave the encoder untouched.

use std::io;
use std::io::ErrorKind;

use bytes::{Buf, BytesMut};
use tokio_util::codec::Encoder;
use tracing::{error, trace};

use crate::codec::body::PayloadEncoder;
use crate::codec::header::HeaderEncoder;
use crate::protocol::{Message, PayloadItem, PayloadSize, ResponseHead, SendError};

#[derive(Debug, Default)]
pub struct ResponseEncoder {
    header_encoder: HeaderEncoder,
    payload_encoder: Option<PayloadEncoder>,
    final_head_sent: bool,
}

impl ResponseEncoder {
    pub fn new() -> Self {
        Default::default()
    }

    /// Whether the body is still open for more payload items.
    pub fn is_payload_open(&self) -> bool {
        self.payload_encoder.is_some()
    }

    pub fn is_chunked(&self) -> bool {
        self.payload_encoder.as_ref().is_some_and(PayloadEncoder::is_chunked)
    }
}

impl<D: Buf> Encoder<Message<(ResponseHead, PayloadSize), D>> for ResponseEncoder {
    type Error = SendError;

    fn encode(&mut self, item: Message<(ResponseHead, PayloadSize), D>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            Message::Header((head, payload_size)) => {
                if head.status().is_informational() {
                    return self.header_encoder.encode((head, payload_size), dst);
                }

                if self.final_head_sent {
                    error!("response head already encoded");
                    return Err(io::Error::from(ErrorKind::InvalidInput).into());
                }
                self.final_head_sent = true;

                let payload_encoder = PayloadEncoder::from(payload_size);
                if !payload_encoder.is_finish() {
                    self.payload_encoder = Some(payload_encoder);
                }
                self.header_encoder.encode((head, payload_size), dst)
            }

            Message::Payload(payload_item) => {
                let Some(payload_encoder) = &mut self.payload_encoder else {
                    return match payload_item {
                        PayloadItem::Chunk(bytes) if bytes.has_remaining() => {
                            error!(final_head_sent = self.final_head_sent, "no open body for payload item");
                            Err(io::Error::from(ErrorKind::InvalidInput).into())
                        }
                        _ => {
                            trace!("ignore empty payload item after the body finished");
                            Ok(())
                        }
                    };
                };

                let result = payload_encoder.encode(payload_item, dst);
                if payload_encoder.is_finish() {
                    self.payload_encoder = None;
                }
                result
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::{Response, StatusCode};

    type Item = Message<(ResponseHead, PayloadSize), Bytes>;

    #[test]
    fn continue_then_chunked_response() {
        let mut encoder = ResponseEncoder::new();
        let mut dst = BytesMut::new();

        let interim = Response::builder().status(StatusCode::CONTINUE).body(()).unwrap();
        encoder.encode(Item::Header((interim, PayloadSize::Empty)), &mut dst).unwrap();
        encoder.encode(Item::Header((Response::new(()), PayloadSize::Chunked)), &mut dst).unwrap();
        assert!(encoder.is_chunked());
        encoder.encode(Item::Payload(PayloadItem::Chunk(Bytes::from_static(b"hi"))), &mut dst).unwrap();
        encoder.encode(Item::Payload(PayloadItem::Eof), &mut dst).unwrap();
        assert!(!encoder.is_payload_open());

        assert_eq!(
            &dst[..],
            &b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n2\r\nhi\r\n0\r\n\r\n"[..]
        );
    }

    #[test]
    fn length_body_closes_itself() {
        let mut encoder = ResponseEncoder::new();
        let mut dst = BytesMut::new();

        encoder.encode(Item::Header((Response::new(()), PayloadSize::Length(2))), &mut dst).unwrap();
        encoder.encode(Item::Payload(PayloadItem::Chunk(Bytes::from_static(b"ok"))), &mut dst).unwrap();
        assert!(!encoder.is_payload_open());

        // empty trailing items are tolerated, data is not
        encoder.encode(Item::Payload(PayloadItem::Eof), &mut dst).unwrap();
        encoder.encode(Item::Payload(PayloadItem::Chunk(Bytes::new())), &mut dst).unwrap();
        assert!(encoder.encode(Item::Payload(PayloadItem::Chunk(Bytes::from_static(b"x"))), &mut dst).is_err());
        assert!(encoder.encode(Item::Header((Response::new(()), PayloadSize::Empty)), &mut dst).is_err());
    }
}
