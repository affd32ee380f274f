//! Statistics Tracker
//!
//! Holds the latest `IngestionStats` snapshot. The flush scheduler is the
//! only writer; any task or thread may read the current snapshot or wait for
//! the next one.

use tokio::sync::watch;

use crate::domain::stats::{FlushOutcome, IngestionStats};

/// Published ingestion statistics.
#[derive(Debug)]
pub struct StatsTracker {
    tx: watch::Sender<IngestionStats>,
}

impl StatsTracker {
    /// Start from a previously persisted snapshot.
    #[must_use]
    pub fn new(initial: IngestionStats) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Apply a flush outcome and publish the result.
    ///
    /// Returns the new snapshot.
    pub fn record_flush(&self, outcome: &FlushOutcome) -> IngestionStats {
        let mut next = IngestionStats::default();
        self.tx.send_modify(|stats| {
            *stats = stats.after(outcome);
            next = stats.clone();
        });
        next
    }

    /// Latest snapshot. Never waits on the scheduler.
    #[must_use]
    pub fn current_stats(&self) -> IngestionStats {
        self.tx.borrow().clone()
    }

    /// Receiver notified on every published snapshot.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<IngestionStats> {
        self.tx.subscribe()
    }
}

impl Default for StatsTracker {
    fn default() -> Self {
        Self::new(IngestionStats::default())
    }
}
