//! Error types for the proxy

use std::fmt;
use std::io;

use tokio_tungstenite::tungstenite;

/// Result type alias for proxy operations
pub type Result<T> = std::result::Result<T, Error>;

/// Proxy error types
#[derive(Debug)]
pub enum Error {
    /// I/O error from an underlying stream
    Io(io::Error),
    /// Invalid WebSocket frame on the wire
    InvalidFrame(&'static str),
    /// Protocol violation (misordered fragments, etc.)
    Protocol(&'static str),
    /// Frame payload exceeds the configured frame limit
    FrameTooLarge,
    /// Reassembled message exceeds the configured message limit
    MessageTooLarge,
    /// Peer went away without a close handshake (EOF, reset)
    ConnectionClosed,
    /// Peer performed a close handshake
    Closed(Option<CloseReason>),
    /// Session was cancelled by the supervisor
    Cancelled,
    /// A read or write deadline expired
    Timeout,
    /// Backend dial failed
    BackendDial(String),
    /// Error surfaced by the backend WebSocket library
    Ws(tungstenite::Error),
    /// QUIC or HTTP/3 connection-level error
    Transport(String),
    /// Invalid startup configuration
    Config(String),
}

/// Close frame reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// Close status code
    pub code: u16,
    /// Optional reason string
    pub reason: String,
}

impl CloseReason {
    /// Normal closure
    pub const NORMAL: u16 = 1000;
    /// Going away (e.g., server shutdown)
    pub const GOING_AWAY: u16 = 1001;
    /// Message too big
    pub const TOO_BIG: u16 = 1009;
    /// Internal server error
    pub const INTERNAL: u16 = 1011;

    /// Create a new close reason
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

impl Error {
    /// Whether this error is a benign session end that should be suppressed
    /// rather than counted and logged.
    ///
    /// Typed kinds are checked first; the message match on
    /// "closed"/"EOF"/"canceled" remains only as a final fallback for errors
    /// whose origin did not preserve a kind.
    pub fn is_benign_close(&self) -> bool {
        match self {
            Error::ConnectionClosed | Error::Closed(_) | Error::Cancelled => true,
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
            ),
            Error::Ws(tungstenite::Error::ConnectionClosed)
            | Error::Ws(tungstenite::Error::AlreadyClosed) => true,
            other => {
                let s = other.to_string();
                s.contains("closed") || s.contains("EOF") || s.contains("canceled")
            }
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::InvalidFrame(msg) => write!(f, "invalid frame: {}", msg),
            Error::Protocol(msg) => write!(f, "protocol error: {}", msg),
            Error::FrameTooLarge => write!(f, "frame too large"),
            Error::MessageTooLarge => write!(f, "message too big"),
            Error::ConnectionClosed => write!(f, "connection closed"),
            Error::Closed(reason) => {
                if let Some(r) = reason {
                    write!(f, "connection closed: {} ({})", r.code, r.reason)
                } else {
                    write!(f, "connection closed")
                }
            }
            Error::Cancelled => write!(f, "session canceled"),
            Error::Timeout => write!(f, "deadline expired"),
            Error::BackendDial(msg) => write!(f, "backend dial failed: {}", msg),
            Error::Ws(e) => write!(f, "backend websocket error: {}", e),
            Error::Transport(msg) => write!(f, "transport error: {}", msg),
            Error::Config(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Ws(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof | io::ErrorKind::BrokenPipe => Error::ConnectionClosed,
            _ => Error::Io(e),
        }
    }
}

impl From<tungstenite::Error> for Error {
    fn from(e: tungstenite::Error) -> Self {
        match e {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                Error::ConnectionClosed
            }
            tungstenite::Error::Io(e) => Error::from(e),
            tungstenite::Error::Capacity(_) => Error::MessageTooLarge,
            other => Error::Ws(other),
        }
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout
    }
}
