//! Wire codecs built on `tokio_util::codec`.
//!
//! - Request handling:
//!   - [`RequestDecoder`]: decodes request heads and their bodies
//!   - Header parsing via the `header` module, body framing via the `body` module
//!
//! - Response handling:
//!   - [`ResponseEncoder`]: encodes a response head and its payload with the announced framing
//!
//! - WebSocket:
//!   - [`FrameCodec`]: decodes client frames and encodes server frames
//!
//! - [`ServerDecoder`]: the connection decoder, HTTP until an upgrade and frames afterwards
//!
//! # Example
//!
//! ```
//! use micro_flux::codec::RequestDecoder;
//! use micro_flux::protocol::Message;
//! use tokio_util::codec::Decoder;
//! use bytes::BytesMut;
//!
//! let mut decoder = RequestDecoder::new();
//! let mut buffer = BytesMut::from("GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n");
//! let message = decoder.decode(&mut buffer).unwrap();
//! assert!(matches!(message, Some(Message::Header(_))));
//! ```

mod body;
mod header;
mod request_decoder;
mod response_encoder;
mod server_decoder;
pub mod websocket;

pub use body::LAST_CHUNK;
pub use request_decoder::RequestDecoder;
pub use response_encoder::ResponseEncoder;
pub use server_decoder::{Inbound, ServerDecoder};
pub use websocket::{Frame, FrameCodec, OpCode};
