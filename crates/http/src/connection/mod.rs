//! HTTP/1.x connection handling.
//!
//! [`HttpConnection`] serves one socket. Everything it does runs on the task that awaits
//! [`HttpConnection::process`]:
//!
//! - Requests are decoded one exchange at a time; the next request is read only after the
//!   current response was released
//! - Request bodies stream to the handler through a bounded channel, a full channel stops reading
//! - Response units arrive from a demand source through the connection mailbox and are written
//!   through a flush bridge
//! - `Expect: 100-continue`, keep-alive and the upgrade to WebSocket are handled here
//!
//! Writes are grouped into flush batches (`channel`) that a single writer moves to the socket
//! in order (`writer`).

mod channel;
mod handshake;
mod http_connection;
mod operations;
mod writer;

pub use http_connection::HttpConnection;
