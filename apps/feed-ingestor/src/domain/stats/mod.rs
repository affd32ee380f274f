//! Ingestion Statistics
//!
//! Cumulative counters describing flush progress, and the outcome of a
//! single flush that advances them. Statistics only ever move forward: a
//! snapshot is derived from the previous one plus one outcome.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of one flush, after all write attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// The batch was committed to the store.
    Written {
        /// Records in the batch.
        batch_size: usize,
        /// Write attempts made, including the successful one.
        attempts: u32,
        /// Time from swap to commit, retries included.
        duration: Duration,
        /// Wall-clock time of the commit.
        completed_at: DateTime<Utc>,
    },
    /// Every attempt failed and the batch was discarded.
    Lost {
        /// Records in the batch.
        batch_size: usize,
        /// Write attempts made.
        attempts: u32,
        /// Time spent before giving up.
        duration: Duration,
    },
}

impl FlushOutcome {
    /// Records in the batch.
    #[must_use]
    pub const fn batch_size(&self) -> usize {
        match self {
            Self::Written { batch_size, .. } | Self::Lost { batch_size, .. } => *batch_size,
        }
    }

    /// Write attempts made.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        match self {
            Self::Written { attempts, .. } | Self::Lost { attempts, .. } => *attempts,
        }
    }

    /// Check whether the batch was committed.
    #[must_use]
    pub const fn is_written(&self) -> bool {
        matches!(self, Self::Written { .. })
    }
}

/// Cumulative ingestion statistics.
///
/// The first four fields form the persisted row; the loss counters are kept
/// in memory for reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionStats {
    /// Records committed to the store, all time.
    pub records_processed: u64,
    /// Time of the last successful flush.
    pub last_flush_at: Option<DateTime<Utc>>,
    /// Size of the last successfully flushed batch.
    pub last_batch_size: u64,
    /// Duration of the last successful flush in milliseconds.
    pub last_flush_duration_ms: u64,
    /// Records discarded after exhausting write attempts.
    pub records_lost: u64,
    /// Batches discarded after exhausting write attempts.
    pub batches_lost: u64,
    /// Individual write attempts that failed.
    pub failed_write_attempts: u64,
}

impl IngestionStats {
    /// Derive the next snapshot from a flush outcome.
    #[must_use]
    pub fn after(&self, outcome: &FlushOutcome) -> Self {
        let mut next = self.clone();

        match outcome {
            FlushOutcome::Written {
                batch_size,
                attempts,
                duration,
                completed_at,
            } => {
                next.records_processed = next.records_processed.saturating_add(*batch_size as u64);
                next.last_flush_at = Some(*completed_at);
                next.last_batch_size = *batch_size as u64;
                next.last_flush_duration_ms = duration_millis(*duration);
                next.failed_write_attempts = next
                    .failed_write_attempts
                    .saturating_add(u64::from(attempts.saturating_sub(1)));
            }
            FlushOutcome::Lost {
                batch_size,
                attempts,
                ..
            } => {
                next.records_lost = next.records_lost.saturating_add(*batch_size as u64);
                next.batches_lost = next.batches_lost.saturating_add(1);
                next.failed_write_attempts = next
                    .failed_write_attempts
                    .saturating_add(u64::from(*attempts));
            }
        }

        next
    }

    /// Keep only the persisted fields, clearing in-memory loss counters.
    #[must_use]
    pub fn persisted(&self) -> Self {
        Self {
            records_processed: self.records_processed,
            last_flush_at: self.last_flush_at,
            last_batch_size: self.last_batch_size,
            last_flush_duration_ms: self.last_flush_duration_ms,
            ..Self::default()
        }
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn written(batch_size: usize, attempts: u32) -> FlushOutcome {
        FlushOutcome::Written {
            batch_size,
            attempts,
            duration: Duration::from_millis(42),
            completed_at: Utc::now(),
        }
    }

    #[test]
    fn written_outcome_advances_totals() {
        let stats = IngestionStats::default().after(&written(4, 1)).after(&written(6, 2));

        assert_eq!(stats.records_processed, 10);
        assert_eq!(stats.last_batch_size, 6);
        assert_eq!(stats.last_flush_duration_ms, 42);
        assert_eq!(stats.failed_write_attempts, 1);
        assert!(stats.last_flush_at.is_some());
        assert_eq!(stats.records_lost, 0);
    }

    #[test]
    fn lost_outcome_leaves_last_flush_untouched() {
        let before = IngestionStats::default().after(&written(3, 1));
        let after = before.after(&FlushOutcome::Lost {
            batch_size: 10,
            attempts: 3,
            duration: Duration::from_secs(1),
        });

        assert_eq!(after.records_processed, 3);
        assert_eq!(after.last_batch_size, 3);
        assert_eq!(after.last_flush_at, before.last_flush_at);
        assert_eq!(after.records_lost, 10);
        assert_eq!(after.batches_lost, 1);
        assert_eq!(after.failed_write_attempts, 3);
    }

    #[test]
    fn persisted_drops_loss_counters() {
        let stats = IngestionStats {
            records_processed: 5,
            records_lost: 2,
            batches_lost: 1,
            failed_write_attempts: 3,
            ..IngestionStats::default()
        };

        let row = stats.persisted();
        assert_eq!(row.records_processed, 5);
        assert_eq!(row.records_lost, 0);
        assert_eq!(row.failed_write_attempts, 0);
    }

    #[test]
    fn outcome_accessors() {
        let outcome = written(7, 2);
        assert_eq!(outcome.batch_size(), 7);
        assert_eq!(outcome.attempts(), 2);
        assert!(outcome.is_written());
    }
}
