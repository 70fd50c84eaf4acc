//! HTTP request body handling implementation.
//!
//! The inbound body is split in two halves connected by a bounded channel:
//!
//! - [`ReqBody`]: the consumer side given to the handler, a `Stream` of chunks that also
//!   implements `http_body::Body`
//! - `BodySender`: the connection side, fed by the connection executor as decoded chunks arrive
//!
//! The bound is the inbound backpressure: while a chunk is parked because the handler did not
//! take the previous ones, the connection stops reading from the socket. A handler that drops its
//! body does not stall the connection, the remaining chunks are drained and discarded so the
//! next request on a keep-alive connection can be framed. Inbound websocket frames travel through
//! the same kind of channel.

mod req_body;

pub use req_body::ReqBody;
pub(crate) use req_body::{BodySender, InboundItem, InboundSender, body_channel, inbound_channel};
