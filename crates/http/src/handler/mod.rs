//! Application-facing handler API.
//!
//! A [`Handler`] is called once per request with an [`HttpServerRequest`] and an
//! [`HttpServerResponse`]. It configures the response and returns a [`Reply`] saying how the
//! response ends: a body source, headers only, an upgrade to WebSocket, or an error.

use std::fmt;
use std::sync::Arc;

use crate::protocol::HttpError;
use crate::reactive::{BoxSource, Unit};

mod request;
mod response;
mod websocket;

pub use request::HttpServerRequest;
pub use response::HttpServerResponse;
pub use websocket::{WebSocketInbound, WebSocketOutbound};

pub trait Handler: Send + Sync {
    fn call(&self, request: HttpServerRequest, response: &mut HttpServerResponse<'_>) -> Reply;
}

#[derive(Debug)]
pub struct HandlerFn<F> {
    f: F,
}

impl<F, R> Handler for HandlerFn<F>
where
    F: Fn(HttpServerRequest, &mut HttpServerResponse<'_>) -> R + Send + Sync,
    R: Into<Reply>,
{
    fn call(&self, request: HttpServerRequest, response: &mut HttpServerResponse<'_>) -> Reply {
        (self.f)(request, response).into()
    }
}

pub fn make_handler<F, R>(f: F) -> HandlerFn<F>
where
    F: Fn(HttpServerRequest, &mut HttpServerResponse<'_>) -> R + Send + Sync,
    R: Into<Reply>,
{
    HandlerFn { f }
}

/// Drives one WebSocket session: consumes inbound frames and returns the outbound units.
pub trait WebSocketHandler: Send + Sync {
    fn call(&self, inbound: WebSocketInbound, outbound: WebSocketOutbound) -> BoxSource<Unit>;
}

impl<F> WebSocketHandler for F
where
    F: Fn(WebSocketInbound, WebSocketOutbound) -> BoxSource<Unit> + Send + Sync,
{
    fn call(&self, inbound: WebSocketInbound, outbound: WebSocketOutbound) -> BoxSource<Unit> {
        self(inbound, outbound)
    }
}

/// How a handler ends its response.
pub enum Reply {
    /// Stream the units of the source as the body.
    Body(BoxSource<Unit>),
    /// The response has no more content than its head.
    Headers,
    /// Switch the connection to WebSocket.
    WebSocket(WebSocketUpgrade),
    /// The handler failed before producing a body.
    Error(HttpError),
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Body(_) => f.write_str("Body"),
            Reply::Headers => f.write_str("Headers"),
            Reply::WebSocket(upgrade) => f.debug_tuple("WebSocket").field(upgrade).finish(),
            Reply::Error(e) => f.debug_tuple("Error").field(e).finish(),
        }
    }
}

impl From<BoxSource<Unit>> for Reply {
    fn from(source: BoxSource<Unit>) -> Self {
        Reply::Body(source)
    }
}

impl From<HttpError> for Reply {
    fn from(e: HttpError) -> Self {
        Reply::Error(e)
    }
}

impl From<Result<Reply, HttpError>> for Reply {
    fn from(result: Result<Reply, HttpError>) -> Self {
        result.unwrap_or_else(Reply::Error)
    }
}

/// A request to switch the connection to WebSocket once the handler returns.
#[derive(Clone)]
pub struct WebSocketUpgrade {
    pub(crate) protocols: Option<String>,
    pub(crate) plain_text: bool,
    pub(crate) handler: Arc<dyn WebSocketHandler>,
}

impl fmt::Debug for WebSocketUpgrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketUpgrade")
            .field("protocols", &self.protocols)
            .field("plain_text", &self.plain_text)
            .finish_non_exhaustive()
    }
}
