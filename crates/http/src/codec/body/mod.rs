//! Payload framing for request and response bodies.
//!
//! - [`PayloadDecoder`]: decodes a request body framed by `Content-Length` or chunked transfer
//!   encoding
//! - [`PayloadEncoder`]: encodes a response body for the framing announced in its head

mod chunked_decoder;
mod length_decoder;
mod payload_decoder;
mod payload_encoder;

pub use payload_decoder::PayloadDecoder;
pub use payload_encoder::LAST_CHUNK;
pub use payload_encoder::PayloadEncoder;
