//! Decoder for request payloads, dispatching on the framing found in the head.

use bytes::BytesMut;
use tokio_util::codec::Decoder;

use crate::codec::body::chunked_decoder::ChunkedDecoder;
use crate::codec::body::length_decoder::LengthDecoder;
use crate::protocol::{ParseError, PayloadItem, PayloadSize};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadDecoder {
    kind: Kind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Kind {
    Length(LengthDecoder),
    Chunked(ChunkedDecoder),
}

impl PayloadDecoder {
    /// The decoder for a request body, `None` when the request has no body at all.
    pub fn for_payload(payload_size: PayloadSize) -> Option<Self> {
        match payload_size {
            PayloadSize::Length(length) => Some(Self { kind: Kind::Length(LengthDecoder::new(length)) }),
            PayloadSize::Chunked => Some(Self { kind: Kind::Chunked(ChunkedDecoder::new()) }),
            // requests are never delimited by close
            PayloadSize::Empty | PayloadSize::UntilClose => None,
        }
    }

    pub fn is_chunked(&self) -> bool {
        matches!(self.kind, Kind::Chunked(_))
    }
}

impl Decoder for PayloadDecoder {
    type Item = PayloadItem;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match &mut self.kind {
            Kind::Length(decoder) => decoder.decode(src),
            Kind::Chunked(decoder) => decoder.decode(src),
        }
    }
}
