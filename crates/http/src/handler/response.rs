use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use futures::{TryStreamExt, stream};
use http::{HeaderMap, HeaderValue, StatusCode, header};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::bridge::CompletionPromise;
use crate::handler::{Reply, WebSocketHandler, WebSocketUpgrade};
use crate::protocol::{HttpError, ResponseState};
use crate::reactive::{BoxSource, Unit, from_stream};

/// The response of one exchange as seen by its handler.
///
/// Every mutation fails with [`HttpError::IllegalState`] once the head went out, which can not
/// happen before the handler returns.
#[derive(Debug)]
pub struct HttpServerResponse<'a> {
    state: &'a mut ResponseState,
    promise: &'a mut CompletionPromise,
}

impl<'a> HttpServerResponse<'a> {
    pub(crate) fn new(state: &'a mut ResponseState, promise: &'a mut CompletionPromise) -> Self {
        Self { state, promise }
    }

    pub fn status_code(&self) -> StatusCode {
        self.state.status()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.state.headers()
    }

    pub fn is_headers_sent(&self) -> bool {
        self.state.is_headers_sent()
    }

    pub fn status(&mut self, status: StatusCode) -> Result<&mut Self, HttpError> {
        self.state.set_status(status)?;
        Ok(self)
    }

    pub fn header<K, V>(&mut self, name: K, value: V) -> Result<&mut Self, HttpError>
    where
        K: header::IntoHeaderName,
        V: TryInto<HeaderValue>,
        V::Error: std::fmt::Display,
    {
        self.state.set_header(name, value)?;
        Ok(self)
    }

    pub fn add_header<K, V>(&mut self, name: K, value: V) -> Result<&mut Self, HttpError>
    where
        K: header::IntoHeaderName,
        V: TryInto<HeaderValue>,
        V::Error: std::fmt::Display,
    {
        self.state.add_header(name, value)?;
        Ok(self)
    }

    pub fn add_cookie(&mut self, name: &str, value: &str) -> Result<&mut Self, HttpError> {
        self.state.add_cookie(name, value)?;
        Ok(self)
    }

    pub fn chunked_transfer(&mut self, chunked: bool) -> Result<&mut Self, HttpError> {
        self.state.set_chunked(chunked)?;
        Ok(self)
    }

    pub fn keep_alive(&mut self, keep_alive: bool) -> Result<&mut Self, HttpError> {
        self.state.set_keep_alive(keep_alive)?;
        Ok(self)
    }

    /// Flushes every body unit as soon as it is written.
    pub fn flush_each(&mut self) -> &mut Self {
        self.state.set_flush_each(true);
        self
    }

    /// Marks the response as a server-sent event stream.
    pub fn sse(&mut self) -> Result<&mut Self, HttpError> {
        self.header(header::CONTENT_TYPE, mime::TEXT_EVENT_STREAM.as_ref())
    }

    /// Ends the response with its head only.
    pub fn send(&mut self) -> Reply {
        let result = self.state.set_chunked(false).and_then(|state| state.set_content_length(0));
        match result {
            Ok(_) => Reply::Headers,
            Err(e) => Reply::Error(e),
        }
    }

    pub fn send_not_found(&mut self) -> Reply {
        match self.state.set_status(StatusCode::NOT_FOUND) {
            Ok(_) => self.send(),
            Err(e) => Reply::Error(e),
        }
    }

    pub fn send_redirect(&mut self, location: &str) -> Reply {
        let result = self.state.set_status(StatusCode::FOUND).and_then(|state| state.set_header(header::LOCATION, location));
        match result {
            Ok(_) => self.send(),
            Err(e) => Reply::Error(e),
        }
    }

    pub fn send_stream(&mut self, source: BoxSource<Unit>) -> Reply {
        Reply::Body(source)
    }

    /// Streams a file with its length as `Content-Length`, or replies 404 when it can't be read.
    ///
    /// The status has to be known when the handler returns, so the file is resolved with one
    /// blocking `stat` on the connection task. The content itself is read with `tokio::fs` on the
    /// source's task.
    pub fn send_file(&mut self, path: impl AsRef<Path>) -> Reply {
        let path = path.as_ref();
        let length = match std::fs::metadata(path) {
            Ok(metadata) if metadata.is_file() => metadata.len(),
            Ok(_) => {
                debug!(path = %path.display(), "not a regular file");
                return self.send_not_found();
            }
            Err(e) => {
                warn!(path = %path.display(), cause = %e, "can't read file");
                return self.send_not_found();
            }
        };
        if let Err(e) = self.state.set_content_length(length) {
            return Reply::Error(e);
        }

        let file = tokio::fs::File::open(path.to_owned());
        let body = stream::once(file).map_ok(ReaderStream::new).try_flatten().map_ok(Unit::Binary);
        Reply::Body(from_stream(body))
    }

    /// Switches to WebSocket once the handler returns.
    ///
    /// `protocols` lists the sub-protocols the server offers, `plain_text` sends byte units as
    /// text frames.
    pub fn upgrade_to_websocket<H>(&mut self, protocols: Option<&str>, plain_text: bool, handler: H) -> Reply
    where
        H: WebSocketHandler + 'static,
    {
        if self.state.is_headers_sent() {
            return Reply::Error(HttpError::illegal_state("headers already sent, can't upgrade to websocket"));
        }
        Reply::WebSocket(WebSocketUpgrade {
            protocols: protocols.map(ToOwned::to_owned),
            plain_text,
            handler: Arc::new(handler),
        })
    }

    /// Resolves when the response was fully written, or with the reason it was not.
    ///
    /// Only the future of the latest call is resolved.
    pub fn completion(&mut self) -> impl Future<Output = Result<(), HttpError>> + Send + 'static {
        let (promise, receiver) = CompletionPromise::new();
        *self.promise = promise;
        async move { receiver.await.unwrap_or(Err(HttpError::RemoteClosed)) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_sets_empty_content_length() {
        let mut state = ResponseState::new(false);
        let mut promise = CompletionPromise::none();
        let mut response = HttpServerResponse::new(&mut state, &mut promise);

        response.status(StatusCode::ACCEPTED).unwrap().header("x-id", "1").unwrap();
        assert!(matches!(response.send(), Reply::Headers));
        assert!(!state.is_chunked());
        assert_eq!(state.content_length(), Some(0));
        assert_eq!(state.status(), StatusCode::ACCEPTED);
    }

    #[test]
    fn redirect_and_not_found() {
        let mut state = ResponseState::new(false);
        let mut promise = CompletionPromise::none();
        let mut response = HttpServerResponse::new(&mut state, &mut promise);
        assert!(matches!(response.send_redirect("/login"), Reply::Headers));
        assert_eq!(state.status(), StatusCode::FOUND);
        assert_eq!(state.headers()[header::LOCATION], "/login");

        let mut state = ResponseState::new(false);
        let mut response = HttpServerResponse::new(&mut state, &mut promise);
        assert!(matches!(response.send_file("/definitely/not/here"), Reply::Headers));
        assert_eq!(state.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn send_file_uses_the_file_length() {
        let path = std::env::temp_dir().join(format!("micro-flux-send-file-{}", std::process::id()));
        std::fs::write(&path, b"0123456789").unwrap();

        let mut state = ResponseState::new(false);
        let mut promise = CompletionPromise::none();
        let mut response = HttpServerResponse::new(&mut state, &mut promise);
        let reply = response.send_file(&path);
        std::fs::remove_file(&path).unwrap();

        assert!(matches!(reply, Reply::Body(_)));
        assert_eq!(state.status(), StatusCode::OK);
        assert_eq!(state.content_length(), Some(10));
        assert!(!state.payload_size(http::Version::HTTP_11).is_chunked());
    }

    #[test]
    fn mutation_after_headers_sent_fails() {
        let mut state = ResponseState::new(false);
        state.mark_headers_sent();
        let mut promise = CompletionPromise::none();
        let mut response = HttpServerResponse::new(&mut state, &mut promise);

        assert!(matches!(response.status(StatusCode::CREATED), Err(HttpError::IllegalState { .. })));
        assert!(matches!(response.sse(), Err(HttpError::IllegalState { .. })));
        assert!(matches!(response.send(), Reply::Error(HttpError::IllegalState { .. })));
    }

    #[tokio::test]
    async fn completion_follows_the_promise() {
        let mut state = ResponseState::new(false);
        let mut promise = CompletionPromise::none();
        let completion = HttpServerResponse::new(&mut state, &mut promise).completion();

        assert!(promise.try_success());
        assert!(completion.await.is_ok());

        let completion = HttpServerResponse::new(&mut state, &mut promise).completion();
        drop(promise);
        assert!(matches!(completion.await, Err(HttpError::RemoteClosed)));
    }
}
