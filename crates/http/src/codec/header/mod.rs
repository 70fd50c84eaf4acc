//! Header section codecs.
//!
//! - [`HeaderDecoder`]: parses a request line and header block, and decides the body framing
//! - [`HeaderEncoder`]: serializes a response head with framing headers matching its payload

mod header_decoder;
mod header_encoder;

pub use header_decoder::HeaderDecoder;
pub use header_encoder::HeaderEncoder;
