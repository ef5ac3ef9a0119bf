//! The opening handshake, cf. RFC 6455 section 4.2

use base64::{engine::general_purpose::STANDARD, Engine as _};
use http::{header, HeaderName, StatusCode};
use sha1::{Digest, Sha1};

use crate::types::{HeadersExt, Method, Request, Response};

/// Appended to the client's key before hashing, cf. RFC 6455 section 1.3
const WS_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

pub const WS_VERSION: &str = "13";

/// `Sec-WebSocket-Accept` for a given `Sec-WebSocket-Key`
pub fn accept_key(key: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key);
    hasher.update(WS_GUID);
    STANDARD.encode(hasher.finalize())
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum HandshakeError {
    #[error("websocket handshake must be a GET")]
    NotGet,

    #[error("connection header does not list 'upgrade'")]
    MissingConnectionUpgrade,

    #[error("missing or malformed sec-websocket-key")]
    BadKey,

    #[error("unsupported sec-websocket-version")]
    UnsupportedVersion,
}

impl HandshakeError {
    /// What we reply instead of switching protocols
    pub fn response(&self) -> Response {
        match self {
            HandshakeError::UnsupportedVersion => {
                let mut res = Response::error(StatusCode::UPGRADE_REQUIRED);
                // cannot fail on a fresh response
                let _ = res.insert_header(
                    HeaderName::from_static("sec-websocket-version"),
                    WS_VERSION,
                );
                res
            }
            _ => Response::error(StatusCode::BAD_REQUEST),
        }
    }
}

/// Whether the client asks for a websocket, valid handshake or not
pub fn wants_websocket(req: &Request) -> bool {
    req.headers.upgrade_is("websocket")
}

/// Validates the client handshake, returning the `Sec-WebSocket-Accept`
/// value to reply with.
pub fn check_handshake(req: &Request) -> Result<String, HandshakeError> {
    if req.method != Method::Get {
        return Err(HandshakeError::NotGet);
    }
    if !req.headers.connection_has("upgrade") {
        return Err(HandshakeError::MissingConnectionUpgrade);
    }
    if req.headers.get_str(header::SEC_WEBSOCKET_VERSION) != Some(WS_VERSION) {
        return Err(HandshakeError::UnsupportedVersion);
    }

    let key = req
        .headers
        .get(header::SEC_WEBSOCKET_KEY)
        .map(|v| v.trim_ascii())
        .ok_or(HandshakeError::BadKey)?;
    // a base64-encoded 16-byte nonce
    match STANDARD.decode(key) {
        Ok(nonce) if nonce.len() == 16 => Ok(accept_key(key)),
        _ => Err(HandshakeError::BadKey),
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http::{header, StatusCode, Version};
    use pretty_assertions::assert_eq;

    use super::{accept_key, check_handshake, wants_websocket, HandshakeError};
    use crate::types::{Method, Request};

    fn handshake(version: &str, key: &'static str) -> Request {
        let mut req = Request::new(Method::Get, "/chat", Version::HTTP_11);
        req.headers
            .insert(header::UPGRADE, Bytes::from_static(b"websocket"));
        req.headers
            .insert(header::CONNECTION, Bytes::from_static(b"keep-alive, Upgrade"));
        req.headers
            .insert(header::SEC_WEBSOCKET_VERSION, Bytes::from(version.to_owned()));
        req.headers
            .insert(header::SEC_WEBSOCKET_KEY, Bytes::from_static(key.as_bytes()));
        req
    }

    #[test]
    fn test_accept_key() {
        // RFC 6455 section 1.3
        assert_eq!(
            accept_key(b"dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRjK+xOo="
        );
    }

    #[test]
    fn test_check_handshake() {
        let req = handshake("13", "dGhlIHNhbXBsZSBub25jZQ==");
        assert!(wants_websocket(&req));
        assert_eq!(
            check_handshake(&req).unwrap(),
            "s3pPLMBiTxaQ9kYGzzhZRjK+xOo="
        );

        let req = handshake("8", "dGhlIHNhbXBsZSBub25jZQ==");
        let err = check_handshake(&req).unwrap_err();
        assert_eq!(err, HandshakeError::UnsupportedVersion);
        let res = err.response();
        assert_eq!(res.status(), StatusCode::UPGRADE_REQUIRED);
        assert_eq!(&res.headers()["sec-websocket-version"][..], b"13");

        let req = handshake("13", "dG9vIHNob3J0");
        let err = check_handshake(&req).unwrap_err();
        assert_eq!(err, HandshakeError::BadKey);
        assert_eq!(err.response().status(), StatusCode::BAD_REQUEST);

        let mut req = handshake("13", "dGhlIHNhbXBsZSBub25jZQ==");
        req.method = Method::Post;
        assert_eq!(check_handshake(&req), Err(HandshakeError::NotGet));
    }
}
