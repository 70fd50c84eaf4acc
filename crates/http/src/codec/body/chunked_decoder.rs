//! Decoder for HTTP chunked transfer encoding.
//!
//! See [RFC 9112 Section 7.1](https://www.rfc-editor.org/rfc/rfc9112.html#name-chunked-transfer-coding).
//! The decoder works line by line: a size line (hex size with optional extensions), the chunk
//! data followed by CRLF, and after the zero-size chunk an optional trailer section ending with an
//! empty line. Trailer fields are discarded.

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::ensure;
use crate::protocol::{ParseError, PayloadItem};

/// Longest size or trailer line accepted before the input is rejected.
const MAX_LINE_SIZE: usize = 4 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Size,
    Data(u64),
    DataCrlf,
    Trailer,
    End,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedDecoder {
    state: State,
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self { state: State::Size }
    }
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for ChunkedDecoder {
    type Item = PayloadItem;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                State::Size => {
                    let Some(line) = take_line(src)? else {
                        return Ok(None);
                    };
                    let size = parse_size(&line)?;
                    trace!(size, "read chunk size");
                    self.state = if size == 0 { State::Trailer } else { State::Data(size) };
                }

                State::Data(remaining) => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let len = remaining.min(src.len() as u64);
                    let bytes = src.split_to(len as usize).freeze();
                    let remaining = remaining - len;
                    self.state = if remaining == 0 { State::DataCrlf } else { State::Data(remaining) };
                    return Ok(Some(PayloadItem::Chunk(bytes)));
                }

                State::DataCrlf => {
                    if src.len() < 2 {
                        return Ok(None);
                    }
                    ensure!(&src[..2] == b"\r\n", ParseError::invalid_body("missing CRLF after chunk data"));
                    src.advance(2);
                    self.state = State::Size;
                }

                State::Trailer => {
                    let Some(line) = take_line(src)? else {
                        return Ok(None);
                    };
                    if line.is_empty() {
                        self.state = State::End;
                        return Ok(Some(PayloadItem::Eof));
                    }
                    trace!(trailer = ?line, "discard chunked trailer field");
                }

                State::End => return Ok(Some(PayloadItem::Eof)),
            }
        }
    }
}

/// Splits one CRLF terminated line off `src`, without its terminator.
fn take_line(src: &mut BytesMut) -> Result<Option<BytesMut>, ParseError> {
    match src.windows(2).position(|w| w == b"\r\n") {
        Some(index) => {
            let line = src.split_to(index);
            src.advance(2);
            Ok(Some(line))
        }
        None => {
            ensure!(src.len() <= MAX_LINE_SIZE, ParseError::invalid_body("chunk line too long"));
            Ok(None)
        }
    }
}

fn parse_size(line: &[u8]) -> Result<u64, ParseError> {
    let size = line.split(|b| *b == b';').next().unwrap_or_default().trim_ascii();
    ensure!(!size.is_empty() && size.len() <= 16, ParseError::invalid_body("invalid chunk size"));

    let mut value = 0u64;
    for b in size {
        let digit = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            b'A'..=b'F' => b - b'A' + 10,
            _ => return Err(ParseError::invalid_body("invalid chunk size")),
        };
        value = (value << 4) | u64::from(digit);
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn chunk(bytes: &'static [u8]) -> Option<PayloadItem> {
        Some(PayloadItem::Chunk(Bytes::from_static(bytes)))
    }

    #[test]
    fn decode_chunks_and_trailer() {
        let mut buffer = BytesMut::from(&b"5;ext=1\r\nhello\r\nA\r\n0123456789\r\n0\r\nX-Trailer: a\r\n\r\nGET"[..]);
        let mut decoder = ChunkedDecoder::new();

        assert_eq!(decoder.decode(&mut buffer).unwrap(), chunk(b"hello"));
        assert_eq!(decoder.decode(&mut buffer).unwrap(), chunk(b"0123456789"));
        assert_eq!(decoder.decode(&mut buffer).unwrap(), Some(PayloadItem::Eof));
        assert_eq!(&buffer[..], b"GET");
    }

    #[test]
    fn decode_partial_input() {
        let mut decoder = ChunkedDecoder::new();
        let mut buffer = BytesMut::from(&b"6\r\nhel"[..]);

        assert_eq!(decoder.decode(&mut buffer).unwrap(), chunk(b"hel"));
        assert_eq!(decoder.decode(&mut buffer).unwrap(), None);

        buffer.extend_from_slice(b"lo!\r");
        assert_eq!(decoder.decode(&mut buffer).unwrap(), chunk(b"lo!"));
        assert_eq!(decoder.decode(&mut buffer).unwrap(), None);

        buffer.extend_from_slice(b"\n0\r\n\r\n");
        assert_eq!(decoder.decode(&mut buffer).unwrap(), Some(PayloadItem::Eof));
        assert!(buffer.is_empty());
    }

    #[test]
    fn reject_invalid_size() {
        let mut buffer = BytesMut::from(&b"zz\r\n"[..]);
        assert!(ChunkedDecoder::new().decode(&mut buffer).is_err());
    }

    #[test]
    fn reject_missing_crlf_after_data() {
        let mut buffer = BytesMut::from(&b"2\r\nabXY"[..]);
        let mut decoder = ChunkedDecoder::new();
        assert_eq!(decoder.decode(&mut buffer).unwrap(), chunk(b"ab"));
        assert!(decoder.decode(&mut buffer).is_err());
    }
}
