use std::error::Error;
use std::io;
use std::io::ErrorKind;
use std::sync::Arc;
use thiserror::Error;

/// Boxed application error, used for handler and demand source failures.
pub type BoxError = Box<dyn Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    #[error("illegal state: {reason}")]
    IllegalState { reason: String },

    #[error("request error: {source}")]
    RequestError {
        #[from]
        source: ParseError,
    },

    #[error("response error: {source}")]
    ResponseError {
        #[from]
        source: SendError,
    },

    #[error("connection closed by remote peer")]
    RemoteClosed,

    #[error("websocket handshake failed: {reason}")]
    HandshakeFailure { reason: String },

    #[error("handler error: {source}")]
    Handler { source: BoxError },
}

impl HttpError {
    pub fn invalid_argument<S: ToString>(str: S) -> Self {
        Self::InvalidArgument { reason: str.to_string() }
    }

    pub fn illegal_state<S: ToString>(str: S) -> Self {
        Self::IllegalState { reason: str.to_string() }
    }

    pub fn handshake_failure<S: ToString>(str: S) -> Self {
        Self::HandshakeFailure { reason: str.to_string() }
    }

    pub fn handler<E: Into<BoxError>>(e: E) -> Self {
        Self::Handler { source: e.into() }
    }

    /// Whether this error only says the peer went away mid-response.
    ///
    /// Such errors are closed quietly instead of being reported as server faults.
    pub fn is_remote_closed(&self) -> bool {
        match self {
            HttpError::RemoteClosed => true,
            HttpError::ResponseError { source } => source.is_remote_closed(),
            HttpError::RequestError { source: ParseError::Io { source } } => is_remote_closed_kind(source.kind()),
            HttpError::Handler { source } => source.downcast_ref::<HttpError>().is_some_and(HttpError::is_remote_closed),
            _ => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("header size too large, current: {current_size} exceed the limit {max_size}")]
    TooLargeHeader { current_size: usize, max_size: usize },

    #[error("header number exceed the limit {max_num}")]
    TooManyHeaders { max_num: usize },

    #[error("invalid header: {reason}")]
    InvalidHeader { reason: String },

    #[error("invalid http version: {0:?}")]
    InvalidVersion(Option<u8>),

    #[error("invalid http method")]
    InvalidMethod,

    #[error("invalid http uri")]
    InvalidUri,

    #[error("invalid content-length header: {reason}")]
    InvalidContentLength { reason: String },

    #[error("invalid body: {reason}")]
    InvalidBody { reason: String },

    #[error("body size too large, exceed the limit {max_size}")]
    TooLargeBody { max_size: usize },

    #[error("invalid websocket frame: {reason}")]
    InvalidFrame { reason: String },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl ParseError {
    pub fn too_large_header(current_size: usize, max_size: usize) -> Self {
        Self::TooLargeHeader { current_size, max_size }
    }

    pub fn too_many_headers(max_num: usize) -> Self {
        Self::TooManyHeaders { max_num }
    }

    pub fn invalid_header<S: ToString>(str: S) -> Self {
        Self::InvalidHeader { reason: str.to_string() }
    }

    pub fn invalid_body<S: ToString>(str: S) -> Self {
        Self::InvalidBody { reason: str.to_string() }
    }

    pub fn invalid_content_length<S: ToString>(str: S) -> Self {
        Self::InvalidContentLength { reason: str.to_string() }
    }

    pub fn too_large_body(max_size: usize) -> Self {
        Self::TooLargeBody { max_size }
    }

    pub fn invalid_frame<S: ToString>(str: S) -> Self {
        Self::InvalidFrame { reason: str.to_string() }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }
}

/// Errors raised while writing to the transport.
///
/// `SendError` is cloneable because one socket failure resolves every write handle that was
/// waiting on the same flush.
#[derive(Error, Debug, Clone)]
pub enum SendError {
    #[error("invalid body: {reason}")]
    InvalidBody { reason: String },

    #[error("connection already closed")]
    Closed,

    #[error("io error: {source}")]
    Io { source: Arc<io::Error> },
}

impl SendError {
    pub fn invalid_body<S: ToString>(str: S) -> Self {
        Self::InvalidBody { reason: str.to_string() }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: Arc::new(e.into()) }
    }

    pub fn is_remote_closed(&self) -> bool {
        match self {
            SendError::Closed => true,
            SendError::Io { source } => is_remote_closed_kind(source.kind()),
            SendError::InvalidBody { .. } => false,
        }
    }
}

impl From<io::Error> for SendError {
    fn from(e: io::Error) -> Self {
        Self::io(e)
    }
}

fn is_remote_closed_kind(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::UnexpectedEof
    )
}
