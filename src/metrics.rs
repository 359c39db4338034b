//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Data-channel connection attempts and send failures
//! - Records read, forwarded, and dropped (by reason)
//! - Batch flush size and latency
//! - Handshake outcomes
//! - Sender lifecycle states and reader resets
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `relay_` and follow Prometheus conventions:
//! counters end in `_total`, gauges represent current state, histograms track
//! distributions (duration, size).

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a data-channel connection attempt.
pub fn record_connect(server_id: i32, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("relay_connects_total", "peer" => server_id.to_string(), "status" => status)
        .increment(1);
}

/// Record a transmission failure on the data channel.
pub fn record_send_failure(server_id: i32) {
    counter!("relay_send_failures_total", "peer" => server_id.to_string()).increment(1);
}

/// Record records read from the change log for one peer's sender.
pub fn record_records_read(server_id: i32, count: usize) {
    counter!("relay_records_read_total", "peer" => server_id.to_string())
        .increment(count as u64);
}

/// Record records accepted into the outbound buffer.
pub fn record_records_forwarded(server_id: i32, count: usize) {
    counter!("relay_records_forwarded_total", "peer" => server_id.to_string())
        .increment(count as u64);
}

/// Record a dropped record with the reason it was filtered.
///
/// Reasons: `origin_loop` (peer's own write), `cache_miss` (freshness
/// unknown), `stale` (superseded by a newer local write).
pub fn record_record_dropped(server_id: i32, reason: &'static str) {
    counter!("relay_records_dropped_total", "peer" => server_id.to_string(), "reason" => reason)
        .increment(1);
}

/// Record a batch flush on the data channel.
pub fn record_batch_flush(server_id: i32, records: usize, bytes: usize, duration: Duration) {
    counter!("relay_batch_flushes_total", "peer" => server_id.to_string()).increment(1);
    histogram!("relay_batch_records", "peer" => server_id.to_string()).record(records as f64);
    histogram!("relay_batch_bytes", "peer" => server_id.to_string()).record(bytes as f64);
    histogram!("relay_batch_flush_duration_seconds", "peer" => server_id.to_string())
        .record(duration.as_secs_f64());
}

/// Record a handshake outcome.
pub fn record_handshake(server_id: i32, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("relay_handshakes_total", "peer" => server_id.to_string(), "status" => status)
        .increment(1);
}

/// Record a reader reset (rollback to a safe resume point).
pub fn record_reader_reset(server_id: i32, rollback: u64) {
    counter!("relay_reader_resets_total", "peer" => server_id.to_string()).increment(1);
    gauge!("relay_reader_rollback_file", "peer" => server_id.to_string()).set(rollback as f64);
}

/// Record a sender lifecycle state ("connecting", "streaming", "stopped",
/// "fatal").
pub fn record_sender_state(server_id: i32, state: &str) {
    gauge!("relay_sender_state", "peer" => server_id.to_string(), "state" => state.to_string())
        .set(1.0);
}

/// Record peers removed by the supervisor.
pub fn record_peer_removed(server_id: i32) {
    counter!("relay_peers_removed_total", "peer" => server_id.to_string()).increment(1);
}

/// Set the engine lifecycle state gauge.
pub fn set_engine_state(state: &str) {
    gauge!("relay_engine_state", "state" => state.to_string()).set(1.0);
}

/// Set the count of live senders.
pub fn set_active_senders(count: usize) {
    gauge!("relay_active_senders").set(count as f64);
}
