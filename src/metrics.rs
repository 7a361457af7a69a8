//! Prometheus metric registration and bump helpers
//!
//! Counters go through the `metrics` facade, so every call site stays a
//! cheap no-op until an exporter is installed. The exporter is only
//! installed when a metrics listen address is configured.

use std::net::SocketAddr;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

pub const ACTIVE_SESSIONS: &str = "h3ws_proxy_active_sessions";
pub const ACCEPTED: &str = "h3ws_proxy_accepted_total";
pub const REJECTED: &str = "h3ws_proxy_rejected_total";
pub const ERRORS: &str = "h3ws_proxy_errors_total";
pub const BYTES: &str = "h3ws_proxy_bytes_total";
pub const MESSAGES: &str = "h3ws_proxy_messages_total";
pub const CONTROL_FRAMES: &str = "h3ws_proxy_control_frames_total";
pub const OVERSIZE_DROPS: &str = "h3ws_proxy_oversize_drops_total";

/// Install the Prometheus exporter serving `/metrics` on `addr`.
pub fn install(addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("failed to install Prometheus exporter: {e}"))?;
    describe();
    Ok(())
}

fn describe() {
    describe_gauge!(ACTIVE_SESSIONS, "Number of active proxy sessions");
    describe_counter!(ACCEPTED, "Accepted RFC9220 sessions");
    describe_counter!(REJECTED, "Rejected requests by reason");
    describe_counter!(ERRORS, "Errors by stage");
    describe_counter!(BYTES, "Bytes forwarded by direction");
    describe_counter!(MESSAGES, "Messages forwarded by direction and type");
    describe_counter!(CONTROL_FRAMES, "Control frames observed");
    describe_counter!(OVERSIZE_DROPS, "Dropped frames/messages due to size limits");
}

pub fn accepted() {
    counter!(ACCEPTED).increment(1);
}

/// `reason` is one of `max_conns`, `method`, `bad_headers`.
pub fn rejected(reason: &'static str) {
    counter!(REJECTED, "reason" => reason).increment(1);
}

/// `stage` is one of `no_stream_takeover`, `backend_dial`, `session`.
pub fn stage_error(stage: &'static str) {
    counter!(ERRORS, "stage" => stage).increment(1);
}

pub fn session_up() {
    gauge!(ACTIVE_SESSIONS).increment(1.0);
}

pub fn session_down() {
    gauge!(ACTIVE_SESSIONS).decrement(1.0);
}

/// Record one forwarded data message and its payload bytes.
/// `dir` is `h3_to_h1` or `h1_to_h3`; `kind` is `text` or `binary`.
pub fn data_message(dir: &'static str, kind: &'static str, len: usize) {
    counter!(MESSAGES, "dir" => dir, "type" => kind).increment(1);
    counter!(BYTES, "dir" => dir).increment(len as u64);
}

/// `kind` is `ping`, `pong`, or `close`.
pub fn control_frame(kind: &'static str) {
    counter!(CONTROL_FRAMES, "type" => kind).increment(1);
}

/// `kind` is `frame` or `message`.
pub fn oversize_drop(kind: &'static str) {
    counter!(OVERSIZE_DROPS, "kind" => kind).increment(1);
}
