//! HTTP request header handling implementation.
//!
//! [`RequestHeader`] is the decoded request line and header block. It is built once by the
//! header decoder and never mutated afterwards; the connection only hands out shared references.

use http::request::Parts;
use http::{HeaderMap, HeaderValue, Method, Request, Uri, Version, header};

/// Represents an HTTP request header.
#[derive(Debug)]
pub struct RequestHeader {
    inner: Request<()>,
}

impl AsRef<Request<()>> for RequestHeader {
    fn as_ref(&self) -> &Request<()> {
        &self.inner
    }
}

impl RequestHeader {
    /// Consumes the header and returns the inner `Request<()>`.
    pub fn into_inner(self) -> Request<()> {
        self.inner
    }

    pub fn method(&self) -> &Method {
        self.inner.method()
    }

    pub fn uri(&self) -> &Uri {
        self.inner.uri()
    }

    pub fn version(&self) -> Version {
        self.inner.version()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    /// Determines if this request may carry a body based on its HTTP method.
    pub fn need_body(&self) -> bool {
        !matches!(self.method(), &Method::GET | &Method::HEAD | &Method::DELETE | &Method::OPTIONS | &Method::CONNECT)
    }

    /// Whether the client sent `Expect: 100-continue`.
    pub fn expects_continue(&self) -> bool {
        self.headers()
            .get(header::EXPECT)
            .is_some_and(|value| value.as_bytes().eq_ignore_ascii_case(b"100-continue"))
    }

    /// Whether the `Upgrade` header asks for a websocket.
    pub fn is_websocket(&self) -> bool {
        self.headers().get_all(header::UPGRADE).iter().any(|value| contains_token(value, "websocket"))
    }

    /// Keep-alive as requested by the client.
    ///
    /// HTTP/1.1 keeps the connection unless `Connection: close` is present, HTTP/1.0 only keeps it
    /// with an explicit `Connection: keep-alive`.
    pub fn is_keep_alive(&self) -> bool {
        let connection = self.headers().get_all(header::CONNECTION);
        match self.version() {
            Version::HTTP_11 => !connection.iter().any(|value| contains_token(value, "close")),
            Version::HTTP_10 => connection.iter().any(|value| contains_token(value, "keep-alive")),
            _ => false,
        }
    }
}

/// Checks a comma separated header value for `token`, ignoring case.
pub(crate) fn contains_token(value: &HeaderValue, token: &str) -> bool {
    value.as_bytes().split(|b| *b == b',').any(|item| item.trim_ascii().eq_ignore_ascii_case(token.as_bytes()))
}

impl From<Parts> for RequestHeader {
    #[inline]
    fn from(parts: Parts) -> Self {
        Self { inner: Request::from_parts(parts, ()) }
    }
}

impl From<Request<()>> for RequestHeader {
    #[inline]
    fn from(inner: Request<()>) -> Self {
        Self { inner }
    }
}
