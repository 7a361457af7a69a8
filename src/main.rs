//! h3ws-proxy binary: flag parsing, logging/metrics bootstrap, listener.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use regex::Regex;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use h3ws_proxy::config::{self, Limits, ProxyConfig};
use h3ws_proxy::error::Error;
use h3ws_proxy::{metrics, server};

#[derive(Debug, Parser)]
#[command(
    name = "h3ws-proxy",
    version,
    about = "HTTP/3 (RFC 9220) to HTTP/1.1 (RFC 6455) WebSocket translating reverse proxy"
)]
struct Args {
    /// UDP listen address for HTTP/3 (e.g. :443, 127.0.0.1:8443)
    #[arg(long, default_value = ":443")]
    listen: String,

    /// TLS certificate PEM file
    #[arg(long, default_value = "cert.pem")]
    cert: PathBuf,

    /// TLS key PEM file
    #[arg(long, default_value = "key.pem")]
    key: PathBuf,

    /// Backend ws:// or wss:// URL (HTTP/1.1 WebSocket), without path
    #[arg(long, default_value = "ws://127.0.0.1:8080")]
    backend: String,

    /// Regexp matched against request paths to accept WebSocket CONNECTs
    #[arg(long, default_value = "^/ws$")]
    path: String,

    /// TCP address for Prometheus /metrics (empty disables the exporter)
    #[arg(long)]
    metrics: Option<String>,

    /// Max WebSocket frame payload bytes on the H3 side
    #[arg(long = "max-frame", default_value_t = 1 << 20)]
    max_frame: u64,

    /// Max reassembled message bytes
    #[arg(long = "max-message", default_value_t = 8 << 20)]
    max_message: u64,

    /// Max concurrent sessions
    #[arg(long = "max-conns", default_value_t = 2000)]
    max_conns: i64,

    /// Backend read deadline
    #[arg(long = "read-timeout", default_value = "120s", value_parser = config::parse_duration)]
    read_timeout: Duration,

    /// Write deadline
    #[arg(long = "write-timeout", default_value = "15s", value_parser = config::parse_duration)]
    write_timeout: Duration,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "h3ws_proxy=info".into()),
        )
        .init();

    if let Err(e) = run(Args::parse()).await {
        error!("{e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

async fn run(args: Args) -> h3ws_proxy::Result<()> {
    let listen = config::parse_listen_addr(&args.listen).map_err(Error::Config)?;
    let backend = config::normalize_backend_url(&args.backend).map_err(Error::Config)?;
    let path_re =
        Regex::new(&args.path).map_err(|e| Error::Config(format!("bad --path regexp: {e}")))?;

    match args.metrics.as_deref().filter(|s| !s.is_empty()) {
        Some(addr) => {
            let addr = config::parse_listen_addr(addr).map_err(Error::Config)?;
            metrics::install(addr).map_err(Error::Config)?;
            info!("metrics listening on http://{addr}/metrics");
        }
        None => info!("metrics disabled (use --metrics to enable)"),
    }

    let config = ProxyConfig {
        listen,
        cert: args.cert,
        key: args.key,
        backend,
        path_re,
        limits: Limits {
            max_frame_size: args.max_frame,
            max_message_size: args.max_message,
            max_conns: args.max_conns,
            read_timeout: args.read_timeout,
            write_timeout: args.write_timeout,
        },
    };

    server::run(config).await
}
