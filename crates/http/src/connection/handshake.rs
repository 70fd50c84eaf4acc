//! Server side of the WebSocket opening handshake (RFC 6455 section 4.2).

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use http::{HeaderValue, Response, StatusCode, Version, header};
use sha1::{Digest, Sha1};

use crate::protocol::{HttpError, RequestHeader, ResponseHead};

const WS_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
pub(crate) const WS_VERSION: &str = "13";

/// An accepted handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Handshake {
    pub(crate) accept: String,
    pub(crate) protocol: Option<String>,
}

/// `Sec-WebSocket-Accept` for a client key.
pub(crate) fn accept_key(key: &[u8]) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key);
    sha1.update(WS_GUID);
    STANDARD.encode(sha1.finalize())
}

/// Validates an upgrade request against the protocols the server offers.
///
/// `protocols` is a comma separated list, `*` accepts whatever the client asks for first.
pub(crate) fn handshake(request: &RequestHeader, protocols: Option<&str>) -> Result<Handshake, HttpError> {
    let headers = request.headers();

    let version = headers.get(header::SEC_WEBSOCKET_VERSION).map(HeaderValue::as_bytes);
    if version != Some(WS_VERSION.as_bytes()) {
        return Err(HttpError::handshake_failure(format!(
            "unsupported websocket version: {}",
            version.map(String::from_utf8_lossy).unwrap_or_default()
        )));
    }

    let Some(key) = headers.get(header::SEC_WEBSOCKET_KEY).filter(|key| !key.is_empty()) else {
        return Err(HttpError::handshake_failure("not a websocket request: missing key"));
    };

    let protocol = headers
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|requested| requested.to_str().ok())
        .and_then(|requested| select_protocol(requested, protocols?));

    Ok(Handshake { accept: accept_key(key.as_bytes()), protocol })
}

fn select_protocol(requested: &str, supported: &str) -> Option<String> {
    requested
        .split(',')
        .map(str::trim)
        .filter(|protocol| !protocol.is_empty())
        .find(|protocol| supported.split(',').map(str::trim).any(|offered| offered == "*" || offered == *protocol))
        .map(ToOwned::to_owned)
}

/// The `101 Switching Protocols` head for an accepted handshake.
pub(crate) fn switching_protocols(handshake: &Handshake) -> Result<ResponseHead, HttpError> {
    let mut head = Response::new(());
    *head.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    *head.version_mut() = Version::HTTP_11;

    let headers = head.headers_mut();
    headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(
        header::SEC_WEBSOCKET_ACCEPT,
        HeaderValue::from_str(&handshake.accept).map_err(HttpError::invalid_argument)?,
    );
    if let Some(protocol) = &handshake.protocol {
        headers.insert(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_str(protocol).map_err(HttpError::invalid_argument)?);
    }
    Ok(head)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Request;

    fn upgrade_request(version: &str, protocols: Option<&str>) -> RequestHeader {
        let mut builder = Request::get("/ws")
            .header(header::UPGRADE, "websocket")
            .header(header::CONNECTION, "Upgrade")
            .header(header::SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
            .header(header::SEC_WEBSOCKET_VERSION, version);
        if let Some(protocols) = protocols {
            builder = builder.header(header::SEC_WEBSOCKET_PROTOCOL, protocols);
        }
        builder.body(()).unwrap().into()
    }

    #[test]
    fn accept_key_matches_rfc_sample() {
        assert_eq!(accept_key(b"dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn first_requested_supported_protocol_wins() {
        let request = upgrade_request("13", Some("mqtt, chat, superchat"));
        let handshake = handshake(&request, Some("superchat,chat")).unwrap();
        assert_eq!(handshake.protocol.as_deref(), Some("chat"));

        let handshake = super::handshake(&request, Some("*")).unwrap();
        assert_eq!(handshake.protocol.as_deref(), Some("mqtt"));

        let handshake = super::handshake(&request, Some("stomp")).unwrap();
        assert_eq!(handshake.protocol, None);

        let handshake = super::handshake(&request, None).unwrap();
        assert_eq!(handshake.protocol, None);
    }

    #[test]
    fn unsupported_version_fails() {
        let request = upgrade_request("8", None);
        assert!(matches!(handshake(&request, None), Err(HttpError::HandshakeFailure { .. })));
    }

    #[test]
    fn missing_key_fails() {
        let request: RequestHeader = Request::get("/ws")
            .header(header::UPGRADE, "websocket")
            .header(header::SEC_WEBSOCKET_VERSION, "13")
            .body(())
            .unwrap()
            .into();
        assert!(matches!(handshake(&request, None), Err(HttpError::HandshakeFailure { .. })));
    }

    #[test]
    fn switching_protocols_head() {
        let handshake = Handshake { accept: accept_key(b"dGhlIHNhbXBsZSBub25jZQ=="), protocol: Some("chat".into()) };
        let head = switching_protocols(&handshake).unwrap();

        assert_eq!(head.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(head.headers()[header::SEC_WEBSOCKET_ACCEPT], "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
        assert_eq!(head.headers()[header::SEC_WEBSOCKET_PROTOCOL], "chat");
        assert_eq!(head.headers()[header::UPGRADE], "websocket");
    }
}
