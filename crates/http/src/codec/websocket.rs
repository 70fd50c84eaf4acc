//! Minimal WebSocket frame codec (RFC 6455 section 5).
//!
//! Server side only: inbound frames must be masked, outbound frames are never masked.
//! Fragmented messages are passed through frame by frame, no extension bits are accepted.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::ensure;
use crate::protocol::{ParseError, SendError};

/// Largest payload a control frame may carry.
const MAX_CONTROL_PAYLOAD: usize = 125;

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
pub const CLOSE_MESSAGE_TOO_BIG: u16 = 1009;
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    fn from_bits(bits: u8) -> Result<Self, ParseError> {
        match bits {
            0x0 => Ok(OpCode::Continuation),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xA => Ok(OpCode::Pong),
            other => Err(ParseError::invalid_frame(format!("unknown opcode {other:#x}"))),
        }
    }

    fn bits(self) -> u8 {
        match self {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

/// One WebSocket frame with an unmasked payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    fin: bool,
    opcode: OpCode,
    payload: Bytes,
}

impl Frame {
    pub fn new(fin: bool, opcode: OpCode, payload: Bytes) -> Self {
        Self { fin, opcode, payload }
    }

    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Text, payload.into())
    }

    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Binary, payload.into())
    }

    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Ping, payload.into())
    }

    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Pong, payload.into())
    }

    /// A close frame carrying a status code and a reason.
    pub fn close(code: u16, reason: &str) -> Self {
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.put_u16(code);
        payload.put_slice(reason.as_bytes());
        Self::new(true, OpCode::Close, payload.freeze())
    }

    pub fn is_fin(&self) -> bool {
        self.fin
    }

    pub fn opcode(&self) -> OpCode {
        self.opcode
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Status code of a close frame, if it carries one.
    pub fn close_code(&self) -> Option<u16> {
        if self.opcode != OpCode::Close || self.payload.len() < 2 {
            return None;
        }
        Some(u16::from_be_bytes([self.payload[0], self.payload[1]]))
    }
}

/// Decodes masked client frames and encodes unmasked server frames.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_payload: usize,
}

impl FrameCodec {
    pub fn new(max_payload: usize) -> Self {
        Self { max_payload }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 2 {
            return Ok(None);
        }

        let first = src[0];
        let second = src[1];
        let fin = first & 0x80 != 0;
        ensure!(first & 0x70 == 0, ParseError::invalid_frame("reserved bits are set"));
        let opcode = OpCode::from_bits(first & 0x0F)?;
        ensure!(second & 0x80 != 0, ParseError::invalid_frame("client frame is not masked"));

        let (length, mut offset) = match second & 0x7F {
            126 => {
                if src.len() < 4 {
                    return Ok(None);
                }
                (u64::from(u16::from_be_bytes([src[2], src[3]])), 4)
            }
            127 => {
                if src.len() < 10 {
                    return Ok(None);
                }
                let mut len = [0u8; 8];
                len.copy_from_slice(&src[2..10]);
                (u64::from_be_bytes(len), 10)
            }
            len => (u64::from(len), 2),
        };

        if opcode.is_control() {
            ensure!(fin, ParseError::invalid_frame("fragmented control frame"));
            ensure!(length <= MAX_CONTROL_PAYLOAD as u64, ParseError::invalid_frame("control frame payload too large"));
        }
        ensure!(length <= self.max_payload as u64, ParseError::too_large_body(self.max_payload));
        let length = length as usize;

        if src.len() < offset + 4 + length {
            src.reserve(offset + 4 + length - src.len());
            return Ok(None);
        }

        let mut mask = [0u8; 4];
        mask.copy_from_slice(&src[offset..offset + 4]);
        offset += 4;

        src.advance(offset);
        let mut payload = src.split_to(length);
        for (i, b) in payload.iter_mut().enumerate() {
            *b ^= mask[i % 4];
        }

        trace!(?opcode, fin, length, "decoded websocket frame");
        Ok(Some(Frame { fin, opcode, payload: payload.freeze() }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = SendError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let length = frame.payload.len();
        dst.reserve(10 + length);

        let fin = if frame.fin { 0x80 } else { 0 };
        dst.put_u8(fin | frame.opcode.bits());
        if length < 126 {
            dst.put_u8(length as u8);
        } else if length <= usize::from(u16::MAX) {
            dst.put_u8(126);
            dst.put_u16(length as u16);
        } else {
            dst.put_u8(127);
            dst.put_u64(length as u64);
        }
        dst.put_slice(&frame.payload);
        Ok(())
    }
}
