//! Runtime configuration
//!
//! Everything here is parsed once at startup and immutable afterwards.
//! `Limits` is shared read-only across all sessions.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use regex::Regex;
use url::Url;

/// Per-session size and deadline limits
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// Max frame payload bytes on the H3 side (0 disables the check)
    pub max_frame_size: u64,
    /// Max reassembled message bytes, both directions
    pub max_message_size: u64,
    /// Global cap on concurrent sessions
    pub max_conns: i64,
    /// Backend per-read deadline
    pub read_timeout: Duration,
    /// Write deadline for data and H3-side control frames
    pub write_timeout: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_frame_size: 1 << 20,
            max_message_size: 8 << 20,
            max_conns: 2000,
            read_timeout: Duration::from_secs(120),
            write_timeout: Duration::from_secs(15),
        }
    }
}

/// Fully validated proxy configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// UDP bind address for the HTTP/3 listener
    pub listen: SocketAddr,
    /// TLS certificate PEM path
    pub cert: PathBuf,
    /// TLS key PEM path
    pub key: PathBuf,
    /// Normalized backend URL (ws/wss, host-level)
    pub backend: Url,
    /// Request paths matching this pattern are treated as WebSocket offers
    pub path_re: Regex,
    pub limits: Limits,
}

/// Parse a listen address, accepting the `:443` shorthand for all interfaces.
pub fn parse_listen_addr(s: &str) -> Result<SocketAddr, String> {
    let candidate = if s.starts_with(':') {
        format!("0.0.0.0{s}")
    } else {
        s.to_string()
    };
    candidate
        .parse()
        .map_err(|e| format!("bad listen address {s:?}: {e}"))
}

/// Parse a duration flag: `120s`, `500ms`, `2m`, `1h`, or bare seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let (number, unit): (&str, fn(u64) -> Duration) = if let Some(v) = s.strip_suffix("ms") {
        (v, Duration::from_millis)
    } else if let Some(v) = s.strip_suffix('s') {
        (v, Duration::from_secs)
    } else if let Some(v) = s.strip_suffix('m') {
        (v, |n| Duration::from_secs(n * 60))
    } else if let Some(v) = s.strip_suffix('h') {
        (v, |n| Duration::from_secs(n * 3600))
    } else {
        (s, Duration::from_secs)
    };
    number
        .parse::<u64>()
        .map(unit)
        .map_err(|e| format!("bad duration {s:?}: {e}"))
}

/// Parse and normalize the backend URL.
///
/// The scheme must be `ws` or `wss`; path, query, and fragment are stripped
/// since backend routing is host-level.
pub fn normalize_backend_url(s: &str) -> Result<Url, String> {
    let mut url: Url = s.parse().map_err(|e| format!("bad backend URL {s:?}: {e}"))?;
    match url.scheme() {
        "ws" | "wss" => {}
        other => return Err(format!("backend scheme must be ws or wss, got {other:?}")),
    }
    url.set_path("");
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listen_addr_shorthand() {
        assert_eq!(
            parse_listen_addr(":443").unwrap(),
            "0.0.0.0:443".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            parse_listen_addr("127.0.0.1:8443").unwrap(),
            "127.0.0.1:8443".parse::<SocketAddr>().unwrap()
        );
        assert!(parse_listen_addr("not an addr").is_err());
    }

    #[test]
    fn test_duration_units() {
        assert_eq!(parse_duration("120s").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn test_backend_url_scheme() {
        assert!(normalize_backend_url("ws://127.0.0.1:8080").is_ok());
        assert!(normalize_backend_url("wss://backend.internal").is_ok());
        assert!(normalize_backend_url("http://127.0.0.1:8080").is_err());
        assert!(normalize_backend_url("not a url").is_err());
    }

    #[test]
    fn test_backend_url_stripped() {
        let url = normalize_backend_url("ws://host:8080/ws/v2?token=x#frag").unwrap();
        assert_eq!(url.path(), "/");
        assert_eq!(url.query(), None);
        assert_eq!(url.fragment(), None);
        assert_eq!(url.host_str(), Some("host"));
        assert_eq!(url.port(), Some(8080));
    }

    #[test]
    fn test_default_limits() {
        let limits = Limits::default();
        assert_eq!(limits.max_frame_size, 1 << 20);
        assert_eq!(limits.max_message_size, 8 << 20);
        assert_eq!(limits.max_conns, 2000);
    }
}
