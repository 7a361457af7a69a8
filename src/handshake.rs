//! Extended CONNECT handshake validation (RFC 9220)
//!
//! The semantics mirror the HTTP/1.1 upgrade (RFC 6455 §4.2) carried over
//! HTTP/3: the client offers `Sec-WebSocket-Key`/`-Version` on a CONNECT
//! request and the proxy answers 200 with the derived accept token, after
//! which the request stream body carries raw frames.

use base64::Engine;
use http::{HeaderMap, Method, Request, Response, StatusCode};
use sha1::{Digest, Sha1};

use crate::WS_GUID;

/// Why a CONNECT offer was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Method was not CONNECT
    Method,
    /// Missing key or wrong version
    BadHeaders,
}

impl Rejection {
    /// HTTP status sent to the client
    pub fn status(&self) -> StatusCode {
        match self {
            Rejection::Method => StatusCode::METHOD_NOT_ALLOWED,
            Rejection::BadHeaders => StatusCode::BAD_REQUEST,
        }
    }

    /// `reason` label for the rejection counter
    pub fn reason(&self) -> &'static str {
        match self {
            Rejection::Method => "method",
            Rejection::BadHeaders => "bad_headers",
        }
    }

    /// Response body, matching the status line wording clients expect
    pub fn body(&self) -> &'static [u8] {
        match self {
            Rejection::Method => b"expected CONNECT\n",
            Rejection::BadHeaders => b"missing/invalid websocket headers\n",
        }
    }
}

/// Approved handshake: everything needed to answer the offer and dial out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// `Sec-WebSocket-Accept` token
    pub accept: String,
    /// First offered sub-protocol token, echoed to both sides
    pub subprotocol: Option<String>,
}

/// Validate a WebSocket offer.
///
/// Checks in order: the method is CONNECT, `Sec-WebSocket-Key` is present
/// and non-empty, and `Sec-WebSocket-Version` is exactly `13`.
pub fn validate<B>(req: &Request<B>) -> Result<Handshake, Rejection> {
    if req.method() != Method::CONNECT {
        return Err(Rejection::Method);
    }

    let key = header_str(req.headers(), "sec-websocket-key").unwrap_or("");
    let version = header_str(req.headers(), "sec-websocket-version").unwrap_or("");
    if key.is_empty() || version != "13" {
        return Err(Rejection::BadHeaders);
    }

    let subprotocol = header_str(req.headers(), "sec-websocket-protocol")
        .map(select_subprotocol)
        .filter(|p| !p.is_empty())
        .map(str::to_owned);

    Ok(Handshake {
        accept: accept_key(key),
        subprotocol,
    })
}

/// Compute the accept token: `base64(SHA1(key ++ GUID))` (RFC 6455 §4.2.2)
#[inline]
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Select the first token of a comma-separated sub-protocol offer.
pub fn select_subprotocol(offer: &str) -> &str {
    offer.split(',').next().unwrap_or("").trim()
}

/// Build the 200 response accepting the tunnel.
pub fn accept_response(hs: &Handshake) -> Response<()> {
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header("sec-websocket-accept", &hs.accept);
    if let Some(proto) = &hs.subprotocol {
        builder = builder.header("sec-websocket-protocol", proto);
    }
    builder.body(()).expect("valid response")
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect_request(key: &str, version: &str) -> Request<()> {
        Request::builder()
            .method(Method::CONNECT)
            .uri("https://example.com/ws")
            .header("sec-websocket-key", key)
            .header("sec-websocket-version", version)
            .body(())
            .unwrap()
    }

    #[test]
    fn test_accept_key_rfc_sample() {
        // The sample handshake from RFC 6455 §1.3
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_validate_ok() {
        let hs = validate(&connect_request("dGhlIHNhbXBsZSBub25jZQ==", "13")).unwrap();
        assert_eq!(hs.accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
        assert_eq!(hs.subprotocol, None);
    }

    #[test]
    fn test_validate_rejects_method() {
        let req = Request::builder()
            .method(Method::GET)
            .uri("https://example.com/ws")
            .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
            .header("sec-websocket-version", "13")
            .body(())
            .unwrap();
        let rej = validate(&req).unwrap_err();
        assert_eq!(rej, Rejection::Method);
        assert_eq!(rej.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(rej.reason(), "method");
    }

    #[test]
    fn test_validate_rejects_bad_headers() {
        let rej = validate(&connect_request("", "13")).unwrap_err();
        assert_eq!(rej, Rejection::BadHeaders);
        assert_eq!(rej.status(), StatusCode::BAD_REQUEST);

        let rej = validate(&connect_request("dGhlIHNhbXBsZSBub25jZQ==", "8")).unwrap_err();
        assert_eq!(rej, Rejection::BadHeaders);
        assert_eq!(rej.reason(), "bad_headers");

        let req = Request::builder()
            .method(Method::CONNECT)
            .uri("https://example.com/ws")
            .body(())
            .unwrap();
        assert!(validate(&req).is_err());
    }

    #[test]
    fn test_subprotocol_first_token() {
        assert_eq!(select_subprotocol("graphql-ws"), "graphql-ws");
        assert_eq!(select_subprotocol(" chat , superchat"), "chat");
        assert_eq!(select_subprotocol(""), "");
    }

    #[test]
    fn test_validate_selects_subprotocol() {
        let mut req = connect_request("dGhlIHNhbXBsZSBub25jZQ==", "13");
        req.headers_mut().insert(
            "sec-websocket-protocol",
            "chat, superchat".parse().unwrap(),
        );
        let hs = validate(&req).unwrap();
        assert_eq!(hs.subprotocol.as_deref(), Some("chat"));
    }

    #[test]
    fn test_accept_response_headers() {
        let hs = Handshake {
            accept: "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=".into(),
            subprotocol: Some("chat".into()),
        };
        let resp = accept_response(&hs);
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get("sec-websocket-accept").unwrap(),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
        assert_eq!(resp.headers().get("sec-websocket-protocol").unwrap(), "chat");
    }
}
