//! Prometheus Metrics Module
//!
//! Exposes ingestion metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Intake**: payloads received from the feed and payloads dropped, by reason
//! - **Parsing**: envelope errors and records accepted into the buffer
//! - **Persistence**: records flushed or lost, failed attempts, flush latency
//! - **Depth**: bridge queue depth and buffer size
//! - **Feed**: connection state and reconnects of the push feed
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port. Recording
//! functions are no-ops until `init_metrics` installs the recorder, so the
//! engine can be driven from tests without one.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Calling it again returns the handle installed by the first call.
///
/// # Errors
///
/// Returns an error if the global recorder cannot be installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "feed_ingestor_messages_received_total",
        "Payloads accepted from the feed into the bridge queue"
    );
    describe_counter!(
        "feed_ingestor_dropped_total",
        "Payloads or elements dropped, by reason"
    );
    describe_counter!(
        "feed_ingestor_parse_errors_total",
        "Payloads whose envelope could not be decoded"
    );
    describe_counter!(
        "feed_ingestor_records_buffered_total",
        "Records accepted into the flush buffer"
    );
    describe_counter!(
        "feed_ingestor_records_flushed_total",
        "Records committed to the store"
    );
    describe_counter!(
        "feed_ingestor_records_lost_total",
        "Records discarded after exhausting write attempts"
    );
    describe_counter!(
        "feed_ingestor_flush_attempt_failures_total",
        "Individual batch write attempts that failed"
    );
    describe_counter!(
        "feed_ingestor_stats_upsert_failures_total",
        "Statistics row writes that failed"
    );

    describe_gauge!(
        "feed_ingestor_queue_depth",
        "Payloads waiting in the bridge queue"
    );
    describe_gauge!(
        "feed_ingestor_buffer_size",
        "Records waiting in the flush buffer"
    );

    describe_gauge!(
        "feed_ingestor_feed_connected",
        "Whether the push feed is connected (1) or not (0)"
    );
    describe_counter!(
        "feed_ingestor_feed_reconnects_total",
        "Push feed reconnection attempts"
    );

    describe_histogram!(
        "feed_ingestor_flush_duration_seconds",
        "Time from buffer swap to commit or give-up, retries included"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Reasons a payload or element is dropped before reaching the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Bridge full, incoming payload rejected.
    OverflowNewest,
    /// Bridge full, oldest queued payload evicted.
    OverflowOldest,
    /// Payload offered after the bridge was closed.
    Closed,
    /// Element for an instrument that is not subscribed.
    Unsubscribed,
    /// Element that is not an object or has no token.
    MalformedElement,
}

impl DropReason {
    /// Label value for this reason.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OverflowNewest => "overflow_newest",
            Self::OverflowOldest => "overflow_oldest",
            Self::Closed => "closed",
            Self::Unsubscribed => "unsubscribed",
            Self::MalformedElement => "malformed_element",
        }
    }
}

/// Record a payload accepted into the bridge queue.
pub fn record_message_received() {
    counter!("feed_ingestor_messages_received_total").increment(1);
}

/// Record dropped payloads or elements.
pub fn record_dropped(reason: DropReason, count: u64) {
    if count == 0 {
        return;
    }
    counter!("feed_ingestor_dropped_total", "reason" => reason.as_str()).increment(count);
}

/// Record a payload whose envelope could not be decoded.
pub fn record_parse_error(kind: &'static str) {
    counter!("feed_ingestor_parse_errors_total", "kind" => kind).increment(1);
}

/// Record records accepted into the buffer.
pub fn record_records_buffered(count: u64) {
    counter!("feed_ingestor_records_buffered_total").increment(count);
}

/// Record a committed batch.
pub fn record_flush_written(records: u64, duration: Duration) {
    counter!("feed_ingestor_records_flushed_total").increment(records);
    histogram!("feed_ingestor_flush_duration_seconds", "outcome" => "written")
        .record(duration.as_secs_f64());
}

/// Record a batch discarded after exhausting write attempts.
pub fn record_flush_lost(records: u64, duration: Duration) {
    counter!("feed_ingestor_records_lost_total").increment(records);
    histogram!("feed_ingestor_flush_duration_seconds", "outcome" => "lost")
        .record(duration.as_secs_f64());
}

/// Record one failed write attempt.
pub fn record_flush_attempt_failure() {
    counter!("feed_ingestor_flush_attempt_failures_total").increment(1);
}

/// Record a failed statistics row write.
pub fn record_stats_upsert_failure() {
    counter!("feed_ingestor_stats_upsert_failures_total").increment(1);
}

/// Update the bridge queue depth.
#[allow(clippy::cast_precision_loss)]
pub fn set_queue_depth(depth: usize) {
    gauge!("feed_ingestor_queue_depth").set(depth as f64);
}

/// Update the buffer size.
#[allow(clippy::cast_precision_loss)]
pub fn set_buffer_size(size: usize) {
    gauge!("feed_ingestor_buffer_size").set(size as f64);
}

/// Update the feed connection state.
pub fn set_feed_connected(source: &'static str, connected: bool) {
    gauge!("feed_ingestor_feed_connected", "source" => source)
        .set(if connected { 1.0 } else { 0.0 });
}

/// Record a feed reconnection attempt.
pub fn record_feed_reconnect(source: &'static str) {
    counter!("feed_ingestor_feed_reconnects_total", "source" => source).increment(1);
}

// =============================================================================
// Tests
// =============================================================================
