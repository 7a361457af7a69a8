//! Backend dialer: HTTP/1.1 WebSocket client side (RFC 6455)
//!
//! Each session dials the backend fresh; there is no pooling. The selected
//! sub-protocol from the client offer is propagated on the dial, and the
//! library-level read limit is pinned to the message limit as a second line
//! of defense against oversized backend reassembly.

use futures_util::stream::{SplitSink, SplitStream};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::{Message, WebSocketConfig};
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::config::Limits;
use crate::error::{Error, Result};

/// Backend WebSocket connection
pub type BackendSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;
/// Write half after splitting
pub type BackendSink = SplitSink<BackendSocket, Message>;
/// Read half after splitting
pub type BackendSource = SplitStream<BackendSocket>;

/// Build the dial request, attaching the selected sub-protocol if any.
pub fn build_request(backend: &Url, subprotocol: Option<&str>) -> Result<Request> {
    let mut request = backend
        .as_str()
        .into_client_request()
        .map_err(|e| Error::BackendDial(e.to_string()))?;

    if let Some(proto) = subprotocol {
        let value = HeaderValue::from_str(proto)
            .map_err(|_| Error::BackendDial(format!("invalid subprotocol {proto:?}")))?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", value);
    }

    Ok(request)
}

/// Dial the backend and return the connected socket.
pub async fn dial(backend: &Url, subprotocol: Option<&str>, limits: &Limits) -> Result<BackendSocket> {
    let request = build_request(backend, subprotocol)?;

    let ws_config = WebSocketConfig {
        max_message_size: Some(limits.max_message_size as usize),
        ..WebSocketConfig::default()
    };

    match connect_async_with_config(request, Some(ws_config), false).await {
        Ok((socket, _response)) => Ok(socket),
        Err(tokio_tungstenite::tungstenite::Error::Http(resp)) => Err(Error::BackendDial(format!(
            "backend answered status {}",
            resp.status()
        ))),
        Err(e) => Err(Error::BackendDial(e.to_string())),
    }
}
