//! Buffer & Flush Scheduler
//!
//! The scheduler task is the sole owner of the record buffer. It dequeues raw
//! payloads from the bridge, parses them, appends the records and hands full
//! or timed-out buffers to a single background write task.
//!
//! ```text
//!            tick / threshold                 write ok | attempts exhausted
//!  Idle ──append──▶ Accumulating ──swap──▶ Flushing ─────────────────────────▶ Idle / Accumulating
//!                                                          │
//!                      shutdown (any state) ──▶ Draining ──┘──▶ Stopped
//! ```
//!
//! At most one write is in flight. Records that arrive meanwhile keep
//! accumulating; a tick or threshold crossing seen during the write starts
//! the next flush as soon as the write completes. Once the buffer reaches
//! `max_buffered_records` during a write, the scheduler stops dequeuing and
//! the bridge's overflow policy absorbs the burst. Every store call runs
//! under `write_timeout`, so a stalled store costs at most
//! `max_flush_attempts` deadlines per batch.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::backoff::{BackoffConfig, BackoffPolicy};
use super::bridge::BridgeQueue;
use super::engine::{EngineConfig, EngineReport, PipelineCounters};
use super::parser::MessageParser;
use super::throttle::LogThrottle;
use super::tracker::StatsTracker;
use crate::application::ports::{FeedStore, StoreError};
use crate::domain::stats::{FlushOutcome, IngestionStats};
use crate::domain::streaming::{FeedRecord, RawMessage};
use crate::infrastructure::metrics::{self, DropReason};

// =============================================================================
// Flush State
// =============================================================================

/// Lifecycle state of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushState {
    /// Buffer empty, no write in flight.
    Idle,
    /// Buffer holds records, no write in flight.
    Accumulating,
    /// A batch write is in flight.
    Flushing,
    /// Shutdown requested; residue is being drained and flushed.
    Draining,
    /// The scheduler task has returned.
    Stopped,
}

impl FlushState {
    /// Returns the string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Accumulating => "accumulating",
            Self::Flushing => "flushing",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }
}

/// What started a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushTrigger {
    Timer,
    Threshold,
    Shutdown,
}

impl FlushTrigger {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Timer => "timer",
            Self::Threshold => "threshold",
            Self::Shutdown => "shutdown",
        }
    }
}

// =============================================================================
// Flush Task
// =============================================================================

/// Result handed back by a write task.
#[derive(Debug)]
struct FlushReport {
    batch_id: u64,
    outcome: FlushOutcome,
    stats_persisted: bool,
}

struct InFlight {
    batch_id: u64,
    batch_size: usize,
    handle: JoinHandle<FlushReport>,
}

/// Settings a write task carries.
#[derive(Debug, Clone)]
struct WritePolicy {
    backoff: BackoffConfig,
    timeout: Duration,
}

/// Await a store call, failing it once `timeout` elapses.
async fn with_deadline<F>(timeout: Duration, call: F) -> Result<(), StoreError>
where
    F: Future<Output = Result<(), StoreError>>,
{
    tokio::time::timeout(timeout, call)
        .await
        .unwrap_or(Err(StoreError::TimedOut { timeout }))
}

/// Write one batch with retries, then persist the resulting statistics row.
async fn run_flush(
    store: Arc<dyn FeedStore>,
    batch: Vec<FeedRecord>,
    batch_id: u64,
    policy: WritePolicy,
    base_stats: IngestionStats,
) -> FlushReport {
    let outcome = write_with_retry(store.as_ref(), &batch, batch_id, &policy).await;
    drop(batch);

    let stats_persisted = match &outcome {
        FlushOutcome::Written { .. } => {
            let row = base_stats.after(&outcome).persisted();
            match with_deadline(policy.timeout, store.upsert_stats(&row)).await {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(batch_id, error = %e, "Failed to persist ingestion stats");
                    false
                }
            }
        }
        FlushOutcome::Lost { .. } => true,
    };

    FlushReport {
        batch_id,
        outcome,
        stats_persisted,
    }
}

async fn write_with_retry(
    store: &dyn FeedStore,
    batch: &[FeedRecord],
    batch_id: u64,
    policy: &WritePolicy,
) -> FlushOutcome {
    let started = Instant::now();
    let mut backoff = BackoffPolicy::new(policy.backoff.clone());
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        match with_deadline(policy.timeout, store.write_batch(batch)).await {
            Ok(()) => {
                return FlushOutcome::Written {
                    batch_size: batch.len(),
                    attempts,
                    duration: started.elapsed(),
                    completed_at: Utc::now(),
                };
            }
            Err(e) => {
                metrics::record_flush_attempt_failure();
                let Some(delay) = backoff.next_delay() else {
                    tracing::error!(
                        batch_id,
                        records = batch.len(),
                        attempt = attempts,
                        error = %e,
                        "Batch write failed, giving up and discarding batch"
                    );
                    return FlushOutcome::Lost {
                        batch_size: batch.len(),
                        attempts,
                        duration: started.elapsed(),
                    };
                };

                tracing::warn!(
                    batch_id,
                    records = batch.len(),
                    attempt = attempts,
                    retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "Batch write failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Wait for the in-flight write, clearing the slot once it completes.
///
/// Pending forever when nothing is in flight.
async fn join_in_flight(slot: &mut Option<InFlight>) -> FlushReport {
    let Some(in_flight) = slot.as_mut() else {
        return std::future::pending().await;
    };

    let joined = (&mut in_flight.handle).await;
    let (batch_id, batch_size) = (in_flight.batch_id, in_flight.batch_size);
    *slot = None;

    joined.unwrap_or_else(|e| {
        tracing::error!(batch_id, records = batch_size, error = %e, "Batch write task failed");
        FlushReport {
            batch_id,
            outcome: FlushOutcome::Lost {
                batch_size,
                attempts: 1,
                duration: Duration::ZERO,
            },
            stats_persisted: true,
        }
    })
}

// =============================================================================
// Scheduler
// =============================================================================

/// Accumulate/flush actor.
pub(crate) struct Scheduler {
    config: EngineConfig,
    bridge: Arc<BridgeQueue>,
    parser: MessageParser,
    store: Arc<dyn FeedStore>,
    tracker: Arc<StatsTracker>,
    counters: Arc<PipelineCounters>,
    state: watch::Sender<FlushState>,
    buffer: Vec<FeedRecord>,
    in_flight: Option<InFlight>,
    flush_due: bool,
    intake_paused: bool,
    next_batch_id: u64,
    parse_log: LogThrottle,
}

impl Scheduler {
    pub(crate) fn new(
        config: EngineConfig,
        bridge: Arc<BridgeQueue>,
        parser: MessageParser,
        store: Arc<dyn FeedStore>,
        tracker: Arc<StatsTracker>,
        counters: Arc<PipelineCounters>,
        state: watch::Sender<FlushState>,
    ) -> Self {
        Self {
            config,
            bridge,
            parser,
            store,
            tracker,
            counters,
            state,
            buffer: Vec::new(),
            in_flight: None,
            flush_due: false,
            intake_paused: false,
            next_batch_id: 1,
            parse_log: LogThrottle::default(),
        }
    }

    /// Run until `shutdown` fires or the bridge is closed, then drain.
    pub(crate) async fn run(mut self, shutdown: CancellationToken) -> EngineReport {
        let period = self.config.flush_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            flush_interval_ms = u64::try_from(period.as_millis()).unwrap_or(u64::MAX),
            buffer_threshold = self.config.buffer_threshold,
            max_flush_attempts = self.config.max_flush_attempts,
            write_timeout_ms =
                u64::try_from(self.config.write_timeout.as_millis()).unwrap_or(u64::MAX),
            max_buffered_records = self.config.max_buffered_records,
            "Flush scheduler started"
        );

        loop {
            let intake_open = self.intake_open();
            tokio::select! {
                biased;

                () = shutdown.cancelled() => break,

                report = join_in_flight(&mut self.in_flight) => {
                    self.complete_flush(report);
                    self.flush_if_due();
                }

                _ = ticker.tick() => self.on_tick(),

                message = self.bridge.dequeue(), if intake_open => match message {
                    Some(message) => {
                        self.ingest(&message);
                        self.flush_if_due();
                    }
                    None => break,
                },
            }
        }

        self.drain().await
    }

    /// Whether the loop may dequeue. Closed while a write is in flight and
    /// the buffer holds `max_buffered_records`.
    fn intake_open(&mut self) -> bool {
        let full = self.in_flight.is_some()
            && self.buffer.len() >= self.config.max_buffered_records;

        if full != self.intake_paused {
            self.intake_paused = full;
            if full {
                tracing::warn!(
                    buffered_records = self.buffer.len(),
                    queue_depth = self.bridge.len(),
                    "Buffer full while a write is in flight, pausing intake"
                );
            } else {
                tracing::info!(buffered_records = self.buffer.len(), "Resuming intake");
            }
        }
        !full
    }

    fn on_tick(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        if self.in_flight.is_some() {
            self.flush_due = true;
        } else {
            self.start_flush(FlushTrigger::Timer);
        }
    }

    /// Start a flush when the threshold was reached or a tick was deferred.
    fn flush_if_due(&mut self) {
        if self.in_flight.is_some() || self.buffer.is_empty() {
            return;
        }
        if self.buffer.len() >= self.config.buffer_threshold {
            self.start_flush(FlushTrigger::Threshold);
        } else if self.flush_due {
            self.start_flush(FlushTrigger::Timer);
        }
    }

    fn ingest(&mut self, message: &RawMessage) {
        self.counters.record_message();

        let outcome = match self.parser.parse(message) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.counters.record_parse_error();
                metrics::record_parse_error(e.kind());
                if let Some(suppressed) = self.parse_log.check() {
                    tracing::warn!(
                        error = %e,
                        payload_len = message.len(),
                        suppressed,
                        "Discarding undecodable feed payload"
                    );
                }
                return;
            }
        };

        if outcome.ignored {
            self.counters.record_ignored();
            tracing::debug!(payload_len = message.len(), "Ignoring control frame");
            return;
        }

        self.counters.record_elements(outcome.unsubscribed, outcome.malformed);
        metrics::record_dropped(DropReason::Unsubscribed, outcome.unsubscribed as u64);
        metrics::record_dropped(DropReason::MalformedElement, outcome.malformed as u64);

        let accepted = outcome.records.len();
        if accepted == 0 {
            return;
        }

        self.buffer.extend(outcome.records);
        self.counters.record_accepted(accepted);
        metrics::record_records_buffered(accepted as u64);
        metrics::set_buffer_size(self.buffer.len());

        if self.in_flight.is_none() && *self.state.borrow() == FlushState::Idle {
            self.set_state(FlushState::Accumulating);
        }
    }

    fn start_flush(&mut self, trigger: FlushTrigger) {
        let batch = std::mem::take(&mut self.buffer);
        let batch_size = batch.len();
        let batch_id = self.next_batch_id;
        self.next_batch_id += 1;
        self.flush_due = false;

        tracing::debug!(
            batch_id,
            records = batch_size,
            trigger = trigger.as_str(),
            "Starting flush"
        );

        let handle = tokio::spawn(run_flush(
            Arc::clone(&self.store),
            batch,
            batch_id,
            WritePolicy {
                backoff: self.config.flush_backoff(),
                timeout: self.config.write_timeout,
            },
            self.tracker.current_stats(),
        ));

        self.in_flight = Some(InFlight {
            batch_id,
            batch_size,
            handle,
        });
        self.counters.record_flush_started();
        metrics::set_buffer_size(0);
        if *self.state.borrow() != FlushState::Draining {
            self.set_state(FlushState::Flushing);
        }
    }

    fn complete_flush(&mut self, report: FlushReport) {
        let FlushReport {
            batch_id,
            outcome,
            stats_persisted,
        } = report;

        let stats = self.tracker.record_flush(&outcome);
        if !stats_persisted {
            self.counters.record_stats_upsert_failure();
            metrics::record_stats_upsert_failure();
        }

        match &outcome {
            FlushOutcome::Written {
                batch_size,
                attempts,
                duration,
                ..
            } => {
                metrics::record_flush_written(*batch_size as u64, *duration);
                tracing::info!(
                    batch_id,
                    records = batch_size,
                    attempt = attempts,
                    duration_ms = stats.last_flush_duration_ms,
                    total_records = stats.records_processed,
                    "Flushed batch"
                );
            }
            FlushOutcome::Lost {
                batch_size,
                duration,
                ..
            } => {
                metrics::record_flush_lost(*batch_size as u64, *duration);
                tracing::error!(
                    batch_id,
                    records = batch_size,
                    records_lost = stats.records_lost,
                    batches_lost = stats.batches_lost,
                    "Batch lost"
                );
            }
        }

        if *self.state.borrow() != FlushState::Draining {
            let next = if self.buffer.is_empty() {
                FlushState::Idle
            } else {
                FlushState::Accumulating
            };
            self.set_state(next);
        }
    }

    async fn drain(mut self) -> EngineReport {
        self.set_state(FlushState::Draining);
        self.bridge.close();

        let mut drained = 0_usize;
        while let Some(message) = self.bridge.try_dequeue() {
            self.ingest(&message);
            drained += 1;
        }

        let residue_before_wait = self.buffer.len();
        tracing::info!(
            drained_messages = drained,
            buffered_records = residue_before_wait,
            flush_in_flight = self.in_flight.is_some(),
            "Draining flush scheduler"
        );

        if self.in_flight.is_some() {
            let report = join_in_flight(&mut self.in_flight).await;
            self.complete_flush(report);
        }

        let final_batch = self.buffer.len();
        if final_batch > 0 {
            self.start_flush(FlushTrigger::Shutdown);
            let report = join_in_flight(&mut self.in_flight).await;
            self.complete_flush(report);
        }

        self.set_state(FlushState::Stopped);
        metrics::set_buffer_size(0);

        let report = EngineReport {
            stats: self.tracker.current_stats(),
            pipeline: self.counters.snapshot(&self.bridge.stats()),
            final_batch_size: final_batch,
        };

        tracing::info!(
            records_processed = report.stats.records_processed,
            records_lost = report.stats.records_lost,
            final_batch = final_batch,
            "Flush scheduler stopped"
        );

        report
    }

    fn set_state(&self, state: FlushState) {
        self.state.send_replace(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::store::InMemoryFeedStore;

    #[test]
    fn flush_state_as_str() {
        assert_eq!(FlushState::Idle.as_str(), "idle");
        assert_eq!(FlushState::Accumulating.as_str(), "accumulating");
        assert_eq!(FlushState::Flushing.as_str(), "flushing");
        assert_eq!(FlushState::Draining.as_str(), "draining");
        assert_eq!(FlushState::Stopped.as_str(), "stopped");
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_store_call_times_out() {
        let store = InMemoryFeedStore::new();
        store.set_write_delay(Duration::from_secs(3600));

        let result = with_deadline(Duration::from_secs(5), store.write_batch(&[])).await;

        assert!(matches!(
            result,
            Err(StoreError::TimedOut { timeout }) if timeout == Duration::from_secs(5)
        ));
        assert_eq!(store.record_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_attempts_lose_the_batch() {
        let store = InMemoryFeedStore::new();
        store.set_write_delay(Duration::from_secs(3600));
        let policy = WritePolicy {
            backoff: BackoffConfig::for_flush(Duration::from_millis(100), Duration::from_secs(1), 2)
                .without_jitter(),
            timeout: Duration::from_secs(5),
        };

        let started = Instant::now();
        let outcome = write_with_retry(&store, &[], 7, &policy).await;

        assert!(matches!(outcome, FlushOutcome::Lost { attempts: 2, .. }));
        assert_eq!(store.write_attempts(), 2);
        assert!(started.elapsed() < Duration::from_secs(11));
    }

    #[test]
    fn flush_trigger_as_str() {
        assert_eq!(FlushTrigger::Timer.as_str(), "timer");
        assert_eq!(FlushTrigger::Threshold.as_str(), "threshold");
        assert_eq!(FlushTrigger::Shutdown.as_str(), "shutdown");
    }
}
