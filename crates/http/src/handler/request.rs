use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use http::{HeaderMap, Method, Uri, Version};

use crate::protocol::body::ReqBody;
use crate::protocol::{Cookies, RequestHeader};

type ParamsResolver = Arc<dyn Fn(&Uri) -> HashMap<String, String> + Send + Sync>;

/// The request as seen by a handler: the decoded head plus the inbound body stream.
pub struct HttpServerRequest {
    header: Arc<RequestHeader>,
    cookies: Arc<Cookies>,
    body: Option<ReqBody>,
    params_resolver: Option<ParamsResolver>,
}

impl HttpServerRequest {
    pub(crate) fn new(header: Arc<RequestHeader>, cookies: Arc<Cookies>, body: ReqBody) -> Self {
        Self { header, cookies, body: Some(body), params_resolver: None }
    }

    pub fn method(&self) -> &Method {
        self.header.method()
    }

    pub fn uri(&self) -> &Uri {
        self.header.uri()
    }

    pub fn version(&self) -> Version {
        self.header.version()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.header.headers()
    }

    pub fn cookies(&self) -> &Cookies {
        &self.cookies
    }

    pub fn is_keep_alive(&self) -> bool {
        self.header.is_keep_alive()
    }

    pub fn is_websocket(&self) -> bool {
        self.header.is_websocket()
    }

    /// Installs the function that extracts path parameters from the uri, typically a router's.
    #[must_use]
    pub fn with_params_resolver<F>(mut self, resolver: F) -> Self
    where
        F: Fn(&Uri) -> HashMap<String, String> + Send + Sync + 'static,
    {
        self.params_resolver = Some(Arc::new(resolver));
        self
    }

    /// Path parameters, `None` without a resolver.
    pub fn params(&self) -> Option<HashMap<String, String>> {
        self.params_resolver.as_ref().map(|resolver| resolver(self.uri()))
    }

    pub fn param(&self, key: &str) -> Option<String> {
        self.params()?.remove(key)
    }

    /// Takes the inbound body; later calls get an empty body.
    pub fn receive(&mut self) -> ReqBody {
        self.body.take().unwrap_or_else(ReqBody::empty)
    }
}

impl fmt::Debug for HttpServerRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpServerRequest")
            .field("method", self.method())
            .field("uri", self.uri())
            .field("version", &self.version())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{Request, header};

    fn request(uri: &str) -> HttpServerRequest {
        let header: RequestHeader = Request::get(uri).header(header::COOKIE, "sid=42").body(()).unwrap().into();
        let cookies = Cookies::from_headers(header.headers());
        HttpServerRequest::new(Arc::new(header), Arc::new(cookies), ReqBody::empty())
    }

    #[test]
    fn params_come_from_the_resolver() {
        let request = request("/users/7");
        assert!(request.params().is_none());

        let request = request.with_params_resolver(|uri| {
            let id = uri.path().rsplit('/').next().unwrap_or_default().to_owned();
            HashMap::from([("id".to_owned(), id)])
        });
        assert_eq!(request.param("id").as_deref(), Some("7"));
        assert_eq!(request.param("name"), None);
    }

    #[test]
    fn cookies_and_body() {
        let mut request = request("/");
        assert_eq!(request.cookies().get("sid"), Some("42"));
        let _ = request.receive();
        assert!(request.receive().payload_size().is_empty());
    }
}
