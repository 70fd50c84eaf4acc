//! HTTP response header handling implementation.
//!
//! [`ResponseHead`] is what the header encoder serializes. [`ResponseState`] is the mutable
//! outbound status and header block of one exchange: it can be changed freely until the headers
//! are marked as sent, after which every mutation is refused with [`HttpError::IllegalState`].

use std::fmt::Display;

use http::header::IntoHeaderName;
use http::{HeaderMap, HeaderValue, Response, StatusCode, Version, header};
use tracing::warn;

use crate::protocol::{HttpError, PayloadSize};

/// Type alias for HTTP response headers, a `http::Response<()>` without body.
pub type ResponseHead = Response<()>;

const HEADERS_SENT: &str = "status and headers already sent";

#[derive(Debug)]
pub struct ResponseState {
    status: StatusCode,
    headers: HeaderMap,
    chunked: bool,
    keep_alive: Option<bool>,
    flush_each: bool,
    headers_sent: bool,
}

impl ResponseState {
    pub fn new(with_date: bool) -> Self {
        let mut headers = HeaderMap::new();
        if with_date {
            let mut buf = faf_http_date::get_date_buff_no_key();
            faf_http_date::get_date_no_key(&mut buf);
            match HeaderValue::from_bytes(&buf) {
                Ok(value) => {
                    headers.insert(header::DATE, value);
                }
                Err(e) => warn!(cause = %e, "can't build date header"),
            }
        }
        Self { status: StatusCode::OK, headers, chunked: true, keep_alive: None, flush_each: false, headers_sent: false }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn set_status(&mut self, status: StatusCode) -> Result<&mut Self, HttpError> {
        self.check_not_sent()?;
        self.status = status;
        Ok(self)
    }

    /// Sets a header, replacing every previous value.
    pub fn set_header<K, V>(&mut self, name: K, value: V) -> Result<&mut Self, HttpError>
    where
        K: IntoHeaderName,
        V: TryInto<HeaderValue>,
        V::Error: Display,
    {
        self.check_not_sent()?;
        let value = value.try_into().map_err(|e| HttpError::invalid_argument(format!("invalid header value: {e}")))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    /// Appends a header value, keeping the existing ones.
    pub fn add_header<K, V>(&mut self, name: K, value: V) -> Result<&mut Self, HttpError>
    where
        K: IntoHeaderName,
        V: TryInto<HeaderValue>,
        V::Error: Display,
    {
        self.check_not_sent()?;
        let value = value.try_into().map_err(|e| HttpError::invalid_argument(format!("invalid header value: {e}")))?;
        self.headers.append(name, value);
        Ok(self)
    }

    pub fn add_cookie(&mut self, name: &str, value: &str) -> Result<&mut Self, HttpError> {
        if name.is_empty() || name.contains(['=', ';', ' ']) {
            return Err(HttpError::invalid_argument(format!("invalid cookie name: {name:?}")));
        }
        self.add_header(header::SET_COOKIE, format!("{name}={value}"))
    }

    pub fn set_chunked(&mut self, chunked: bool) -> Result<&mut Self, HttpError> {
        self.check_not_sent()?;
        self.headers.remove(header::TRANSFER_ENCODING);
        self.chunked = chunked;
        Ok(self)
    }

    pub fn set_keep_alive(&mut self, keep_alive: bool) -> Result<&mut Self, HttpError> {
        self.check_not_sent()?;
        self.keep_alive = Some(keep_alive);
        Ok(self)
    }

    pub fn set_content_length(&mut self, length: u64) -> Result<&mut Self, HttpError> {
        self.set_header(header::CONTENT_LENGTH, length)
    }

    pub fn set_flush_each(&mut self, flush_each: bool) {
        self.flush_each = flush_each;
    }

    pub fn is_flush_each(&self) -> bool {
        self.flush_each
    }

    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    /// The keep-alive override set by the application, if any.
    pub fn keep_alive(&self) -> Option<bool> {
        self.keep_alive
    }

    pub fn content_length(&self) -> Option<u64> {
        self.headers.get(header::CONTENT_LENGTH).and_then(|value| value.to_str().ok()).and_then(|s| s.trim().parse().ok())
    }

    pub fn is_content_length_set(&self) -> bool {
        self.content_length().is_some()
    }

    pub fn is_headers_sent(&self) -> bool {
        self.headers_sent
    }

    /// Flips the header-sent flag.
    ///
    /// Returns `true` only for the call that performed the transition, so exactly one caller
    /// gets to write the head.
    pub fn mark_headers_sent(&mut self) -> bool {
        if self.headers_sent {
            return false;
        }
        self.headers_sent = true;
        true
    }

    /// The framing the body will use when the head is sent now.
    pub fn payload_size(&self, version: Version) -> PayloadSize {
        match self.content_length() {
            Some(length) => PayloadSize::new_length(length),
            None if self.chunked && version == Version::HTTP_11 => PayloadSize::Chunked,
            None => PayloadSize::UntilClose,
        }
    }

    /// Builds the head that goes on the wire.
    pub(crate) fn head(&self) -> ResponseHead {
        let mut head = Response::new(());
        *head.status_mut() = self.status;
        *head.version_mut() = Version::HTTP_11;
        *head.headers_mut() = self.headers.clone();
        head
    }

    /// Writes the connection header matching the keep-alive decision.
    ///
    /// Used right before the head is encoded, so it bypasses the header-sent check.
    pub(crate) fn apply_connection_header(&mut self, keep_alive: bool, version: Version) {
        if !keep_alive {
            self.headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
        } else if version == Version::HTTP_10 {
            self.headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        }
    }

    fn check_not_sent(&self) -> Result<(), HttpError> {
        if self.headers_sent {
            return Err(HttpError::illegal_state(HEADERS_SENT));
        }
        Ok(())
    }
}
