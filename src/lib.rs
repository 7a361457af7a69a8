//! # h3ws-proxy
//!
//! A protocol-translating reverse proxy: terminates WebSocket-over-HTTP/3
//! sessions (RFC 9220 extended CONNECT) and re-originates each one as a
//! classical WebSocket-over-HTTP/1.1 session (RFC 6455) to a configured
//! backend.
//!
//! ```text
//! ┌────────────┐   QUIC / HTTP/3    ┌────────────────┐   TCP / HTTP/1.1   ┌─────────┐
//! │ H3 client  │ ─────────────────▶ │   h3ws-proxy   │ ─────────────────▶ │ backend │
//! │ (RFC 9220) │   CONNECT + raw    │  frame codec + │   RFC 6455 client  │  (ws[s])│
//! └────────────┘   RFC 6455 frames  │  session pumps │                    └─────────┘
//! ```
//!
//! Each accepted session runs two concurrent pumps: one decodes RFC 6455
//! frames from the HTTP/3 request stream, reassembles fragmented messages,
//! and forwards them to the backend; the other forwards backend messages
//! back as frames on the request stream. Control frames (ping/pong/close)
//! are bridged in both directions, size and concurrency limits are enforced,
//! and teardown is coordinated so both pumps always exit before the session
//! is released.

pub mod backend;
pub mod config;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod metrics;
pub mod pumps;
pub mod server;
pub mod session;

pub use config::{Limits, ProxyConfig};
pub use error::{CloseReason, Error, Result};
pub use session::Proxy;

/// WebSocket GUID for the accept-token handshake (RFC 6455 §1.3)
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
