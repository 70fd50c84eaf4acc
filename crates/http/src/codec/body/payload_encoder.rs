//! Encoder for response payloads.
//!
//! - `Length`: bytes are written as they are, and never beyond the announced length
//! - `Chunked`: every non-empty chunk becomes `<hex size>\r\n<data>\r\n`, `Eof` the last chunk
//! - `UntilClose`: bytes are written as they are, the connection close ends the body
//! - `NoBody`: nothing is written

use std::io::Write;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::Encoder;
use tracing::warn;

use crate::protocol::{PayloadItem, PayloadSize, SendError};

/// The zero-size chunk that ends a chunked body, with an empty trailer section.
pub const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadEncoder {
    kind: Kind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Kind {
    Length { remaining: u64 },
    Chunked { eof: bool },
    UntilClose { eof: bool },
    NoBody,
}

impl From<PayloadSize> for PayloadEncoder {
    fn from(payload_size: PayloadSize) -> Self {
        let kind = match payload_size {
            PayloadSize::Length(remaining) => Kind::Length { remaining },
            PayloadSize::Chunked => Kind::Chunked { eof: false },
            PayloadSize::UntilClose => Kind::UntilClose { eof: false },
            PayloadSize::Empty => Kind::NoBody,
        };
        Self { kind }
    }
}

impl PayloadEncoder {
    pub fn is_chunked(&self) -> bool {
        matches!(self.kind, Kind::Chunked { .. })
    }

    /// Whether nothing more can be written for this payload.
    pub fn is_finish(&self) -> bool {
        match self.kind {
            Kind::Length { remaining } => remaining == 0,
            Kind::Chunked { eof } | Kind::UntilClose { eof } => eof,
            Kind::NoBody => true,
        }
    }
}

impl<D: Buf> Encoder<PayloadItem<D>> for PayloadEncoder {
    type Error = SendError;

    fn encode(&mut self, item: PayloadItem<D>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match (&mut self.kind, item) {
            (Kind::Length { remaining }, PayloadItem::Chunk(mut bytes)) => {
                let len = bytes.remaining() as u64;
                if len > *remaining {
                    return Err(SendError::invalid_body(format!("{len} bytes exceed the remaining content-length {remaining}")));
                }
                *remaining -= len;
                put_buf(dst, &mut bytes);
                Ok(())
            }
            (Kind::Length { .. }, PayloadItem::Eof) => Ok(()),

            (Kind::Chunked { eof: true }, _) | (Kind::UntilClose { eof: true }, _) => {
                warn!("encode payload item after the payload finished");
                Ok(())
            }
            (Kind::Chunked { .. }, PayloadItem::Chunk(mut bytes)) => {
                if !bytes.has_remaining() {
                    return Ok(());
                }
                write!(helper::Writer(dst), "{:X}\r\n", bytes.remaining())?;
                put_buf(dst, &mut bytes);
                dst.put_slice(b"\r\n");
                Ok(())
            }
            (Kind::Chunked { eof }, PayloadItem::Eof) => {
                *eof = true;
                dst.put_slice(LAST_CHUNK);
                Ok(())
            }

            (Kind::UntilClose { .. }, PayloadItem::Chunk(mut bytes)) => {
                put_buf(dst, &mut bytes);
                Ok(())
            }
            (Kind::UntilClose { eof }, PayloadItem::Eof) => {
                *eof = true;
                Ok(())
            }

            (Kind::NoBody, PayloadItem::Chunk(bytes)) if bytes.has_remaining() => {
                Err(SendError::invalid_body("response declared no body"))
            }
            (Kind::NoBody, _) => Ok(()),
        }
    }
}

fn put_buf<D: Buf>(dst: &mut BytesMut, bytes: &mut D) {
    dst.reserve(bytes.remaining());
    while bytes.has_remaining() {
        let chunk = bytes.chunk();
        let len = chunk.len();
        dst.put_slice(chunk);
        bytes.advance(len);
    }
}

mod helper {
    use bytes::{BufMut, BytesMut};
    use std::io;

    pub struct Writer<'a>(pub &'a mut BytesMut);

    impl io::Write for Writer<'_> {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.put_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn chunked_framing() {
        let mut encoder = PayloadEncoder::from(PayloadSize::Chunked);
        let mut dst = BytesMut::new();

        encoder.encode(PayloadItem::Chunk(Bytes::from_static(b"hello world!")), &mut dst).unwrap();
        encoder.encode(PayloadItem::Chunk(Bytes::new()), &mut dst).unwrap();
        assert!(!encoder.is_finish());
        encoder.encode(PayloadItem::<Bytes>::Eof, &mut dst).unwrap();
        assert!(encoder.is_finish());

        assert_eq!(&dst[..], b"C\r\nhello world!\r\n0\r\n\r\n");
    }

    #[test]
    fn length_framing_refuses_overflow() {
        let mut encoder = PayloadEncoder::from(PayloadSize::Length(5));
        let mut dst = BytesMut::new();

        encoder.encode(PayloadItem::Chunk(Bytes::from_static(b"abc")), &mut dst).unwrap();
        assert!(encoder.encode(PayloadItem::Chunk(Bytes::from_static(b"def")), &mut dst).is_err());
        encoder.encode(PayloadItem::Chunk(Bytes::from_static(b"de")), &mut dst).unwrap();
        assert!(encoder.is_finish());
        assert_eq!(&dst[..], b"abcde");
    }

    #[test]
    fn until_close_writes_raw_bytes() {
        let mut encoder = PayloadEncoder::from(PayloadSize::UntilClose);
        let mut dst = BytesMut::new();

        encoder.encode(PayloadItem::Chunk(Bytes::from_static(b"raw")), &mut dst).unwrap();
        encoder.encode(PayloadItem::<Bytes>::Eof, &mut dst).unwrap();
        assert_eq!(&dst[..], b"raw");
    }
}
