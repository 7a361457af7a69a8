//! Session supervisor
//!
//! Owns the lifecycle of one proxied session: admission against the global
//! cap, handshake validation, stream takeover, backend dial, running the two
//! pumps, and coordinated teardown. The first pump to exit decides the
//! session outcome; the supervisor then cancels the other, closes both
//! streams, and waits for it before releasing the session.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use http::Request;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use url::Url;

use crate::backend;
use crate::config::Limits;
use crate::error::{CloseReason, Error, Result};
use crate::handshake;
use crate::metrics;
use crate::pumps;
use crate::server::{self, H3ReadHalf, H3RequestStream, H3WriteHalf};

/// Shared proxy state: immutable configuration plus the global session count.
pub struct Proxy {
    /// Normalized backend URL
    pub backend: Url,
    /// Shared limits
    pub limits: Limits,
    active: AtomicI64,
}

impl Proxy {
    pub fn new(backend: Url, limits: Limits) -> Self {
        Self {
            backend,
            limits,
            active: AtomicI64::new(0),
        }
    }

    /// Admission gate. The increment happens before the check; the returned
    /// guard undoes it on every exit path, including the refusal itself.
    fn try_admit(self: &Arc<Self>) -> Option<ActiveGuard> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        let guard = ActiveGuard {
            proxy: Arc::clone(self),
        };
        (now <= self.limits.max_conns).then_some(guard)
    }

    /// Current number of in-flight sessions.
    pub fn active_count(&self) -> i64 {
        self.active.load(Ordering::SeqCst)
    }
}

struct ActiveGuard {
    proxy: Arc<Proxy>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.proxy.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Holds the `active_sessions` gauge up for the lifetime of a session.
struct SessionGauge;

impl SessionGauge {
    fn up() -> Self {
        metrics::session_up();
        SessionGauge
    }
}

impl Drop for SessionGauge {
    fn drop(&mut self) {
        metrics::session_down();
    }
}

/// Handle one extended CONNECT offer end to end.
pub async fn handle(proxy: Arc<Proxy>, request: Request<()>, mut stream: H3RequestStream) {
    let _active = match proxy.try_admit() {
        Some(guard) => guard,
        None => {
            metrics::rejected("max_conns");
            server::respond_plain(
                stream,
                http::StatusCode::SERVICE_UNAVAILABLE,
                b"too many connections\n",
            )
            .await;
            return;
        }
    };

    let hs = match handshake::validate(&request) {
        Ok(hs) => hs,
        Err(rejection) => {
            metrics::rejected(rejection.reason());
            server::respond_plain(stream, rejection.status(), rejection.body()).await;
            return;
        }
    };

    // accept the tunnel, then take over the raw stream
    if let Err(e) = stream.send_response(handshake::accept_response(&hs)).await {
        debug!(error = %e, "failed to send tunnel response");
        return;
    }
    let (send, recv) = stream.split();
    let h3_reader = H3ReadHalf::new(recv);
    let h3_writer = Arc::new(Mutex::new(H3WriteHalf::new(send)));

    let socket = match backend::dial(&proxy.backend, hs.subprotocol.as_deref(), &proxy.limits).await
    {
        Ok(socket) => socket,
        Err(e) => {
            metrics::stage_error("backend_dial");
            warn!(error = %e, backend = %proxy.backend, "backend dial failed");
            let _ = pumps::write_close_to_h3(
                &h3_writer,
                CloseReason::INTERNAL,
                "backend dial failed",
                proxy.limits.write_timeout,
            )
            .await;
            return;
        }
    };

    metrics::accepted();
    let _gauge = SessionGauge::up();

    let (backend_sink, backend_source) = socket.split();
    let backend_sink = Arc::new(Mutex::new(backend_sink));

    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel::<Result<()>>(2);
    let limits = proxy.limits;

    let forward = {
        let tx = tx.clone();
        let cancel = cancel.clone();
        let h3_writer = Arc::clone(&h3_writer);
        let backend_sink = Arc::clone(&backend_sink);
        tokio::spawn(async move {
            let result =
                pumps::pump_h3_to_backend(cancel, h3_reader, h3_writer, backend_sink, limits).await;
            let _ = tx.send(result).await;
        })
    };

    let reverse = {
        let tx = tx.clone();
        let cancel = cancel.clone();
        let h3_writer = Arc::clone(&h3_writer);
        let backend_sink = Arc::clone(&backend_sink);
        tokio::spawn(async move {
            let result = pumps::pump_backend_to_h3(
                cancel,
                backend_source,
                backend_sink,
                h3_writer,
                limits,
            )
            .await;
            let _ = tx.send(result).await;
        })
    };
    drop(tx);

    let first = match rx.recv().await {
        Some(result) => result,
        None => Err(Error::ConnectionClosed),
    };

    // tear down: cancel the surviving pump and abort in-flight I/O
    cancel.cancel();
    {
        let mut writer = h3_writer.lock().await;
        let _ = writer.shutdown().await;
    }
    {
        let mut sink = backend_sink.lock().await;
        let _ = sink.close().await;
    }

    // the second pump's outcome is never propagated to the client
    let _ = rx.recv().await;
    let _ = forward.await;
    let _ = reverse.await;

    match first {
        Ok(()) => {}
        Err(e) if e.is_benign_close() => {
            debug!(error = %e, "session ended");
        }
        Err(e) => {
            metrics::stage_error("session");
            error!(error = %e, "session ended");
        }
    }
}
