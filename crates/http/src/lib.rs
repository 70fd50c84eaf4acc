//! A reactive HTTP/1.x server connection.
//!
//! The crate serves one HTTP/1.x connection at a time on top of tokio. Handlers receive the
//! decoded request and a mutable response; they return a [`handler::Reply`] that says how the
//! response ends. Response bodies are demand-driven sources: the connection requests units,
//! writes them and flushes them with one of two strategies:
//!
//! - flush-each: every unit is flushed on its own and the next unit is requested once the
//!   previous write reached the socket
//! - flush-last: units are requested without bound and written as they come, a single flush
//!   ends the response
//!
//! A request with an `Upgrade: websocket` handshake can be switched to a WebSocket session, whose
//! outbound frames go through the same machinery.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//! use tracing::{error, info, warn};
//! use micro_flux::connection::HttpConnection;
//! use micro_flux::handler::{HttpServerRequest, HttpServerResponse, Reply, make_handler};
//! use micro_flux::reactive::just;
//!
//! fn hello(request: HttpServerRequest, response: &mut HttpServerResponse<'_>) -> Reply {
//!     info!(path = request.uri().path(), "hello");
//!     match response.header(http::header::CONTENT_TYPE, "text/plain") {
//!         Ok(response) => response.send_stream(just("Hello World!\r\n".into())),
//!         Err(e) => Reply::Error(e),
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let listener = match TcpListener::bind("127.0.0.1:8080").await {
//!         Ok(listener) => listener,
//!         Err(e) => {
//!             error!(cause = %e, "bind server error");
//!             return;
//!         }
//!     };
//!
//!     let handler = Arc::new(make_handler(hello));
//!     loop {
//!         let (stream, _remote_addr) = match listener.accept().await {
//!             Ok(accepted) => accepted,
//!             Err(e) => {
//!                 warn!(cause = %e, "failed to accept");
//!                 continue;
//!             }
//!         };
//!
//!         let handler = Arc::clone(&handler);
//!         tokio::spawn(async move {
//!             let (reader, writer) = stream.into_split();
//!             if let Err(e) = HttpConnection::new(reader, writer).process(handler).await {
//!                 error!(cause = %e, "connection failed");
//!             }
//!         });
//!     }
//! }
//! ```
//!
//! # Architecture
//!
//! - [`connection`]: the per-connection executor, keep-alive, `100-continue` and the upgrade
//! - [`bridge`]: the flush-each and flush-last bridges between a source and the connection
//! - [`reactive`]: the demand source contract and stream adapters
//! - [`handler`]: the application-facing request, response and WebSocket API
//! - [`protocol`]: message types, response state and errors
//! - [`codec`]: the HTTP/1.x and WebSocket wire codecs
//! - [`config`]: per-connection settings
//!
//! # Limitations
//!
//! - HTTP/1.x only, no TLS
//! - Requests on one connection are served strictly one after another, no pipelining
//! - WebSocket extensions and fragmented message reassembly are left to the application


pub mod bridge;
pub mod codec;
pub mod config;
pub mod connection;
pub mod handler;
pub mod protocol;
pub mod reactive;

mod utils;
pub(crate) use utils::ensure;
