//! HTTP/3 listener and request routing (RFC 9220)
//!
//! Accepts QUIC connections, drives the HTTP/3 layer with extended CONNECT
//! enabled, and routes each request: paths matching the configured pattern
//! go to the session supervisor, `/` answers a plain health probe, anything
//! else is 404. After a successful handshake the request stream is split
//! into read/write halves exposed as `AsyncRead`/`AsyncWrite` so the frame
//! codec can run directly on the stream body.

use std::future::Future;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use http::{Method, Request, Response, StatusCode};
use quinn::{Endpoint, ServerConfig};
use regex::Regex;
use rustls::pki_types::CertificateDer;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, info};

use crate::config::ProxyConfig;
use crate::error::{Error, Result};
use crate::metrics;
use crate::session::{self, Proxy};

/// QUIC idle timeout; H3-side read liveness leans on this, not on
/// per-read deadlines.
const QUIC_MAX_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// QUIC keep-alive period
const QUIC_KEEP_ALIVE_PERIOD: Duration = Duration::from_secs(20);

/// Unsplit request stream, as resolved by the h3 layer
pub type H3RequestStream = h3::server::RequestStream<h3_quinn::BidiStream<Bytes>, Bytes>;
/// Send half after takeover
pub type H3SendStream = h3::server::RequestStream<h3_quinn::SendStream<Bytes>, Bytes>;
/// Receive half after takeover
pub type H3RecvStream = h3::server::RequestStream<h3_quinn::RecvStream, Bytes>;

/// Bind the QUIC endpoint and serve until the endpoint is closed.
pub async fn run(config: ProxyConfig) -> Result<()> {
    let tls = load_tls_config(&config.cert, &config.key)?;
    let quic = quinn::crypto::rustls::QuicServerConfig::try_from(tls)
        .map_err(|e| Error::Config(format!("invalid TLS config: {e}")))?;

    let mut server_config = ServerConfig::with_crypto(Arc::new(quic));
    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(
        QUIC_MAX_IDLE_TIMEOUT
            .try_into()
            .map_err(|_| Error::Config("idle timeout out of range".into()))?,
    ));
    transport.keep_alive_interval(Some(QUIC_KEEP_ALIVE_PERIOD));
    server_config.transport_config(Arc::new(transport));

    let endpoint = Endpoint::server(server_config, config.listen)
        .map_err(|e| Error::Config(format!("bind {}: {e}", config.listen)))?;

    info!(
        listen = %config.listen,
        path = %config.path_re,
        backend = %config.backend,
        "HTTP/3 WebSocket proxy listening"
    );

    let proxy = Arc::new(Proxy::new(config.backend, config.limits));
    let path_re = Arc::new(config.path_re);

    while let Some(incoming) = endpoint.accept().await {
        let proxy = Arc::clone(&proxy);
        let path_re = Arc::clone(&path_re);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(incoming, proxy, path_re).await {
                debug!(error = %e, "HTTP/3 connection ended");
            }
        });
    }

    Ok(())
}

/// Drive one QUIC connection's HTTP/3 request loop.
async fn handle_connection(
    incoming: quinn::Incoming,
    proxy: Arc<Proxy>,
    path_re: Arc<Regex>,
) -> Result<()> {
    let connection = incoming
        .await
        .map_err(|e| Error::Transport(e.to_string()))?;

    let mut h3_conn: h3::server::Connection<h3_quinn::Connection, Bytes> = h3::server::builder()
        .enable_extended_connect(true)
        .build(h3_quinn::Connection::new(connection))
        .await
        .map_err(|e| Error::Transport(e.to_string()))?;

    loop {
        match h3_conn.accept().await {
            Ok(Some(resolver)) => {
                let (request, stream) = match resolver.resolve_request().await {
                    Ok(parts) => parts,
                    Err(e) => {
                        metrics::stage_error("no_stream_takeover");
                        debug!(error = %e, "failed to take over request stream");
                        continue;
                    }
                };

                let proxy = Arc::clone(&proxy);
                let path_re = Arc::clone(&path_re);
                tokio::spawn(async move {
                    route(proxy, path_re, request, stream).await;
                });
            }
            Ok(None) => break, // connection closed gracefully
            Err(e) => {
                debug!(error = %e, "HTTP/3 accept error");
                break;
            }
        }
    }

    Ok(())
}

/// Route one resolved request.
///
/// The path pattern decides what counts as a WebSocket offer; method
/// enforcement happens inside the supervisor so a non-CONNECT request to a
/// matching path is answered 405 with the corresponding rejection metric.
async fn route(proxy: Arc<Proxy>, path_re: Arc<Regex>, request: Request<()>, stream: H3RequestStream) {
    if path_re.is_match(request.uri().path()) {
        session::handle(proxy, request, stream).await;
        return;
    }

    if request.method() != Method::CONNECT && request.uri().path() == "/" {
        respond_plain(stream, StatusCode::OK, b"ok\n").await;
        return;
    }

    respond_plain(stream, StatusCode::NOT_FOUND, b"404 page not found\n").await;
}

/// Send a plain response with a short body and finish the stream.
pub(crate) async fn respond_plain(
    mut stream: H3RequestStream,
    status: StatusCode,
    body: &'static [u8],
) {
    let response = Response::builder()
        .status(status)
        .header("content-type", "text/plain; charset=utf-8")
        .body(())
        .expect("valid response");
    if stream.send_response(response).await.is_ok() {
        let _ = stream.send_data(Bytes::from_static(body)).await;
    }
    let _ = stream.finish().await;
}

/// Load the TLS materials and prepare a server config with `h3` ALPN.
fn load_tls_config(cert: &Path, key: &Path) -> Result<rustls::ServerConfig> {
    let cert_pem = std::fs::read(cert)
        .map_err(|e| Error::Config(format!("read cert {}: {e}", cert.display())))?;
    let key_pem =
        std::fs::read(key).map_err(|e| Error::Config(format!("read key {}: {e}", key.display())))?;

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| Error::Config(format!("parse cert {}: {e}", cert.display())))?;
    if certs.is_empty() {
        return Err(Error::Config(format!(
            "no certificates in {}",
            cert.display()
        )));
    }

    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .map_err(|e| Error::Config(format!("parse key {}: {e}", key.display())))?
        .ok_or_else(|| Error::Config(format!("no private key in {}", key.display())))?;

    let mut tls = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Config(format!("TLS config: {e}")))?;
    tls.alpn_protocols = vec![b"h3".to_vec()];
    Ok(tls)
}

// ============================================================================
// Stream takeover: AsyncRead/AsyncWrite over the request stream halves
// ============================================================================

/// Read half of a taken-over request stream.
///
/// Data arriving from the h3 layer in chunks larger than the caller's buffer
/// is carried over; end of stream surfaces as a zero-byte read.
pub struct H3ReadHalf {
    stream: H3RecvStream,
    buffered: BytesMut,
}

impl H3ReadHalf {
    pub fn new(stream: H3RecvStream) -> Self {
        Self {
            stream,
            buffered: BytesMut::new(),
        }
    }
}

impl AsyncRead for H3ReadHalf {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if !this.buffered.is_empty() {
            let n = buf.remaining().min(this.buffered.len());
            buf.put_slice(&this.buffered.split_to(n));
            return Poll::Ready(Ok(()));
        }

        let mut fut = Box::pin(this.stream.recv_data());
        match fut.as_mut().poll(cx) {
            Poll::Ready(Ok(Some(mut data))) => {
                drop(fut);
                let n = buf.remaining().min(data.remaining());
                let chunk = data.copy_to_bytes(n);
                buf.put_slice(&chunk);
                while data.has_remaining() {
                    let chunk = data.chunk();
                    this.buffered.extend_from_slice(chunk);
                    let len = chunk.len();
                    data.advance(len);
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Ok(None)) => Poll::Ready(Ok(())), // stream finished
            Poll::Ready(Err(e)) => Poll::Ready(Err(io::Error::other(e.to_string()))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Write half of a taken-over request stream.
pub struct H3WriteHalf {
    stream: H3SendStream,
}

impl H3WriteHalf {
    pub fn new(stream: H3SendStream) -> Self {
        Self { stream }
    }
}

impl AsyncWrite for H3WriteHalf {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let this = self.get_mut();

        let data = Bytes::copy_from_slice(buf);
        let fut = this.stream.send_data(data);
        tokio::pin!(fut);

        match fut.poll(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(buf.len())),
            Poll::Ready(Err(e)) => Poll::Ready(Err(io::Error::other(e.to_string()))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // QUIC flushes internally
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let fut = this.stream.finish();
        tokio::pin!(fut);

        match fut.poll(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(())),
            Poll::Ready(Err(e)) => Poll::Ready(Err(io::Error::other(e.to_string()))),
            Poll::Pending => Poll::Pending,
        }
    }
}
