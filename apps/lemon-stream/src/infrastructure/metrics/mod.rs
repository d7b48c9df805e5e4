//! Prometheus Metrics Module
//!
//! Exposes streamer metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Frames**: Frames received from the broker and frames that failed to decode
//! - **Quotes**: Quotes applied to the store, ignored, or seeded from the snapshot
//! - **Lifecycle**: Connection state, credential fetches, refreshes, reconnects
//!
//! Without [`init_metrics`] the recording functions are no-ops.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::application::ports::StreamState;

static EXPORTER_ADDR: OnceLock<SocketAddr> = OnceLock::new();

// =============================================================================
// Exporter
// =============================================================================

/// Install the Prometheus recorder with an HTTP listener on `port`.
///
/// Must be called from within a Tokio runtime. Calling it again is a no-op
/// that returns the address of the running listener.
///
/// # Errors
///
/// Returns an error if the recorder or the listener cannot be installed.
pub fn init_metrics(port: u16) -> Result<SocketAddr, BuildError> {
    if let Some(addr) = EXPORTER_ADDR.get() {
        return Ok(*addr);
    }

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    register_metrics();

    let _ = EXPORTER_ADDR.set(addr);
    tracing::info!(%addr, "Prometheus exporter listening");
    Ok(addr)
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "lemon_stream_frames_received_total",
        "Total protocol frames received from the broker"
    );
    describe_counter!(
        "lemon_stream_decode_errors_total",
        "Total frames or payloads that could not be decoded"
    );
    describe_counter!(
        "lemon_stream_quotes_total",
        "Total quotes received, by outcome"
    );
    describe_counter!(
        "lemon_stream_quotes_seeded_total",
        "Total quotes taken from the latest-quote snapshot"
    );
    describe_gauge!(
        "lemon_stream_connection_state",
        "1 for the current connection state, 0 for the others"
    );
    describe_counter!(
        "lemon_stream_credential_fetches_total",
        "Total credential requests, by result"
    );
    describe_counter!(
        "lemon_stream_refreshes_total",
        "Total completed credential refreshes"
    );
    describe_counter!(
        "lemon_stream_reconnects_total",
        "Total reconnection attempts"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

const STATES: [StreamState; 6] = [
    StreamState::Disconnected,
    StreamState::Connecting,
    StreamState::Connected,
    StreamState::Subscribing,
    StreamState::Subscribed,
    StreamState::Streaming,
];

/// Publish the current connection state.
pub fn set_stream_state(state: StreamState) {
    for candidate in STATES {
        gauge!(
            "lemon_stream_connection_state",
            "state" => candidate.as_str()
        )
        .set(if candidate == state { 1.0 } else { 0.0 });
    }
}

/// Record a frame read from the WebSocket.
pub fn record_frame_received() {
    counter!("lemon_stream_frames_received_total").increment(1);
}

/// Record a frame or payload that failed to decode.
pub fn record_decode_error() {
    counter!("lemon_stream_decode_errors_total").increment(1);
}

/// Record a quote, applied to the store or ignored as untracked.
pub fn record_quote(applied: bool) {
    counter!(
        "lemon_stream_quotes_total",
        "outcome" => if applied { "applied" } else { "ignored" }
    )
    .increment(1);
}

/// Record quotes taken from the latest-quote snapshot.
pub fn record_seeded(count: usize) {
    counter!("lemon_stream_quotes_seeded_total")
        .increment(u64::try_from(count).unwrap_or(u64::MAX));
}

/// Record a credential request.
pub fn record_credential_fetch(success: bool) {
    counter!(
        "lemon_stream_credential_fetches_total",
        "result" => if success { "ok" } else { "error" }
    )
    .increment(1);
}

/// Record a completed credential refresh.
pub fn record_refresh() {
    counter!("lemon_stream_refreshes_total").increment(1);
}

/// Record a reconnection attempt.
pub fn record_reconnect() {
    counter!("lemon_stream_reconnects_total").increment(1);
}

// =============================================================================
// Tests
// =============================================================================
