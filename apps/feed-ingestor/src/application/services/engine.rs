//! Ingestion Engine
//!
//! Wires the bridge queue, parser, flush scheduler and statistics tracker
//! together and exposes the handles the rest of the service needs:
//!
//! - a `FeedSink` for feed sources
//! - an `EngineMonitor` for read-only status (health server, tests)
//! - `EngineHandle::shutdown` for an orderly drain

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::backoff::BackoffConfig;
use super::bridge::{BridgeQueue, BridgeStats, OverflowPolicy};
use super::parser::MessageParser;
use super::scheduler::{FlushState, Scheduler};
use super::tracker::StatsTracker;
use crate::application::ports::{FeedSink, FeedStore, InstrumentDirectory};
use crate::domain::stats::IngestionStats;

// =============================================================================
// Configuration
// =============================================================================

/// Engine tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Period of the flush timer.
    pub flush_interval: Duration,
    /// Buffer length that triggers an immediate flush.
    pub buffer_threshold: usize,
    /// Bridge queue capacity.
    pub queue_capacity: usize,
    /// What to drop when the bridge is full.
    pub overflow_policy: OverflowPolicy,
    /// Write attempts per batch, the first one included.
    pub max_flush_attempts: u32,
    /// Delay before the first write retry.
    pub flush_backoff_initial: Duration,
    /// Upper bound for write retry delays.
    pub flush_backoff_max: Duration,
    /// Jitter fraction applied to write retry delays.
    pub flush_backoff_jitter: f64,
    /// Deadline for a single store call; an elapsed call is a failed attempt.
    pub write_timeout: Duration,
    /// Buffered records at which intake pauses while a write is in flight.
    pub max_buffered_records: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(3),
            buffer_threshold: 1000,
            queue_capacity: 10_000,
            overflow_policy: OverflowPolicy::DropNewest,
            max_flush_attempts: 3,
            flush_backoff_initial: Duration::from_millis(200),
            flush_backoff_max: Duration::from_secs(5),
            flush_backoff_jitter: 0.1,
            write_timeout: Duration::from_secs(30),
            max_buffered_records: 10_000,
        }
    }
}

impl EngineConfig {
    /// Backoff used between write attempts of one batch.
    #[must_use]
    pub fn flush_backoff(&self) -> BackoffConfig {
        BackoffConfig {
            jitter_factor: self.flush_backoff_jitter,
            ..BackoffConfig::for_flush(
                self.flush_backoff_initial,
                self.flush_backoff_max,
                self.max_flush_attempts,
            )
        }
    }

    /// Clamp values that would stall the engine.
    fn normalized(mut self) -> Self {
        if self.flush_interval.is_zero() {
            self.flush_interval = Duration::from_millis(1);
        }
        self.buffer_threshold = self.buffer_threshold.max(1);
        self.queue_capacity = self.queue_capacity.max(1);
        self.max_flush_attempts = self.max_flush_attempts.max(1);
        if self.write_timeout.is_zero() {
            self.write_timeout = Duration::from_millis(1);
        }
        self.max_buffered_records = self.max_buffered_records.max(self.buffer_threshold);
        self
    }
}

// =============================================================================
// Pipeline Counters
// =============================================================================

/// Counters for events that never reach the statistics row.
#[derive(Debug, Default)]
pub struct PipelineCounters {
    messages_processed: AtomicU64,
    parse_errors: AtomicU64,
    ignored_messages: AtomicU64,
    malformed_elements: AtomicU64,
    unsubscribed_elements: AtomicU64,
    records_accepted: AtomicU64,
    flushes_started: AtomicU64,
    stats_upsert_failures: AtomicU64,
}

impl PipelineCounters {
    pub(crate) fn record_message(&self) {
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_ignored(&self) {
        self.ignored_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_elements(&self, unsubscribed: usize, malformed: usize) {
        self.unsubscribed_elements
            .fetch_add(unsubscribed as u64, Ordering::Relaxed);
        self.malformed_elements
            .fetch_add(malformed as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_accepted(&self, records: usize) {
        self.records_accepted
            .fetch_add(records as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_flush_started(&self) {
        self.flushes_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_stats_upsert_failure(&self) {
        self.stats_upsert_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Read all counters, merging in the bridge's.
    #[must_use]
    pub fn snapshot(&self, bridge: &BridgeStats) -> PipelineSnapshot {
        PipelineSnapshot {
            messages_enqueued: bridge.enqueued,
            overflow_dropped: bridge.overflow_dropped,
            rejected_closed: bridge.rejected_closed,
            queue_depth: bridge.depth,
            messages_processed: self.messages_processed.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            ignored_messages: self.ignored_messages.load(Ordering::Relaxed),
            malformed_elements: self.malformed_elements.load(Ordering::Relaxed),
            unsubscribed_elements: self.unsubscribed_elements.load(Ordering::Relaxed),
            records_accepted: self.records_accepted.load(Ordering::Relaxed),
            flushes_started: self.flushes_started.load(Ordering::Relaxed),
            stats_upsert_failures: self.stats_upsert_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the pipeline counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineSnapshot {
    /// Payloads accepted by the bridge.
    pub messages_enqueued: u64,
    /// Payloads dropped by the overflow policy.
    pub overflow_dropped: u64,
    /// Payloads offered after the bridge closed.
    pub rejected_closed: u64,
    /// Payloads waiting in the bridge.
    pub queue_depth: usize,
    /// Payloads taken off the bridge and parsed.
    pub messages_processed: u64,
    /// Payloads with an undecodable envelope.
    pub parse_errors: u64,
    /// Control frames without market data.
    pub ignored_messages: u64,
    /// Elements skipped as malformed.
    pub malformed_elements: u64,
    /// Elements dropped for unsubscribed instruments.
    pub unsubscribed_elements: u64,
    /// Records appended to the buffer.
    pub records_accepted: u64,
    /// Flushes started.
    pub flushes_started: u64,
    /// Statistics row writes that failed.
    pub stats_upsert_failures: u64,
}

// =============================================================================
// Reports and Status
// =============================================================================

/// Final accounting returned by `EngineHandle::shutdown`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineReport {
    /// Statistics after the final flush.
    pub stats: IngestionStats,
    /// Pipeline counters after the final flush.
    pub pipeline: PipelineSnapshot,
    /// Records in the final shutdown flush (0 if none was needed).
    pub final_batch_size: usize,
}

/// Live status of a running engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStatus {
    /// Scheduler state.
    pub state: FlushState,
    /// Latest statistics snapshot.
    pub stats: IngestionStats,
    /// Pipeline counters.
    pub pipeline: PipelineSnapshot,
}

/// Error returned when the engine task could not be joined.
#[derive(Debug, thiserror::Error)]
#[error("ingestion engine task failed: {0}")]
pub struct EngineJoinError(#[from] tokio::task::JoinError);

// =============================================================================
// Engine
// =============================================================================

/// Entry point for starting the ingestion engine.
#[derive(Debug)]
pub struct IngestionEngine;

impl IngestionEngine {
    /// Load persisted statistics and spawn the scheduler task.
    ///
    /// A store that cannot return its statistics row does not prevent the
    /// start; totals then restart from zero and the failure is logged.
    pub async fn start(
        config: EngineConfig,
        store: Arc<dyn FeedStore>,
        directory: Arc<dyn InstrumentDirectory>,
    ) -> EngineHandle {
        let config = config.normalized();

        let initial = match store.load_stats().await {
            Ok(Some(stats)) => {
                tracing::info!(
                    records_processed = stats.records_processed,
                    last_flush_at = ?stats.last_flush_at,
                    "Loaded persisted ingestion stats"
                );
                stats
            }
            Ok(None) => IngestionStats::default(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load ingestion stats, starting from zero");
                IngestionStats::default()
            }
        };

        let bridge = Arc::new(BridgeQueue::new(config.queue_capacity, config.overflow_policy));
        let tracker = Arc::new(StatsTracker::new(initial));
        let counters = Arc::new(PipelineCounters::default());
        let (state_tx, state_rx) = watch::channel(FlushState::Idle);
        let shutdown = CancellationToken::new();

        let scheduler = Scheduler::new(
            config,
            Arc::clone(&bridge),
            MessageParser::new(directory),
            store,
            Arc::clone(&tracker),
            Arc::clone(&counters),
            state_tx,
        );
        let task = tokio::spawn(scheduler.run(shutdown.clone()));

        EngineHandle {
            monitor: EngineMonitor {
                bridge,
                tracker,
                counters,
                state: state_rx,
            },
            shutdown,
            task,
        }
    }
}

/// Read-only view of a running engine. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EngineMonitor {
    bridge: Arc<BridgeQueue>,
    tracker: Arc<StatsTracker>,
    counters: Arc<PipelineCounters>,
    state: watch::Receiver<FlushState>,
}

impl EngineMonitor {
    /// Latest statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> IngestionStats {
        self.tracker.current_stats()
    }

    /// Receiver notified on every statistics change.
    #[must_use]
    pub fn subscribe_stats(&self) -> watch::Receiver<IngestionStats> {
        self.tracker.subscribe()
    }

    /// Current pipeline counters.
    #[must_use]
    pub fn pipeline(&self) -> PipelineSnapshot {
        self.counters.snapshot(&self.bridge.stats())
    }

    /// Current scheduler state.
    #[must_use]
    pub fn state(&self) -> FlushState {
        *self.state.borrow()
    }

    /// Check whether the engine accepts payloads.
    #[must_use]
    pub fn is_accepting(&self) -> bool {
        !self.bridge.is_closed()
    }

    /// Full status snapshot.
    #[must_use]
    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            state: self.state(),
            stats: self.stats(),
            pipeline: self.pipeline(),
        }
    }
}

/// Owner handle of a running engine.
#[derive(Debug)]
pub struct EngineHandle {
    monitor: EngineMonitor,
    shutdown: CancellationToken,
    task: JoinHandle<EngineReport>,
}

impl EngineHandle {
    /// Sink for feed sources.
    #[must_use]
    pub fn sink(&self) -> FeedSink {
        self.monitor.bridge.sink()
    }

    /// Read-only view for status consumers.
    #[must_use]
    pub fn monitor(&self) -> EngineMonitor {
        self.monitor.clone()
    }

    /// Latest statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> IngestionStats {
        self.monitor.stats()
    }

    /// Stop accepting payloads, drain, flush the residue once, and wait.
    ///
    /// # Errors
    ///
    /// Returns an error if the scheduler task panicked.
    pub async fn shutdown(self) -> Result<EngineReport, EngineJoinError> {
        self.shutdown.cancel();
        Ok(self.task.await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = EngineConfig::default();
        assert_eq!(config.flush_interval, Duration::from_secs(3));
        assert_eq!(config.buffer_threshold, 1000);
        assert_eq!(config.queue_capacity, 10_000);
        assert_eq!(config.overflow_policy, OverflowPolicy::DropNewest);
        assert_eq!(config.max_flush_attempts, 3);
    }

    #[test]
    fn normalized_clamps_zeroes() {
        let config = EngineConfig {
            flush_interval: Duration::ZERO,
            buffer_threshold: 0,
            queue_capacity: 0,
            max_flush_attempts: 0,
            ..EngineConfig::default()
        }
        .normalized();

        assert!(!config.flush_interval.is_zero());
        assert_eq!(config.buffer_threshold, 1);
        assert_eq!(config.queue_capacity, 1);
        assert_eq!(config.max_flush_attempts, 1);
    }

    #[test]
    fn normalized_keeps_buffer_cap_above_threshold() {
        let config = EngineConfig {
            buffer_threshold: 500,
            max_buffered_records: 10,
            write_timeout: Duration::ZERO,
            ..EngineConfig::default()
        }
        .normalized();

        assert_eq!(config.max_buffered_records, 500);
        assert!(!config.write_timeout.is_zero());
    }

    #[test]
    fn flush_backoff_follows_attempts() {
        let config = EngineConfig {
            max_flush_attempts: 4,
            flush_backoff_jitter: 0.0,
            ..EngineConfig::default()
        };
        let backoff = config.flush_backoff();
        assert_eq!(backoff.max_retries, Some(3));
        assert_eq!(backoff.initial_delay, Duration::from_millis(200));
        assert!(backoff.jitter_factor.abs() < f64::EPSILON);
    }

    #[test]
    fn snapshot_merges_bridge_counters() {
        let counters = PipelineCounters::default();
        counters.record_message();
        counters.record_elements(2, 1);
        counters.record_accepted(5);

        let bridge = BridgeStats {
            enqueued: 9,
            overflow_dropped: 3,
            ..BridgeStats::default()
        };
        let snapshot = counters.snapshot(&bridge);

        assert_eq!(snapshot.messages_enqueued, 9);
        assert_eq!(snapshot.overflow_dropped, 3);
        assert_eq!(snapshot.messages_processed, 1);
        assert_eq!(snapshot.unsubscribed_elements, 2);
        assert_eq!(snapshot.malformed_elements, 1);
        assert_eq!(snapshot.records_accepted, 5);
    }
}
