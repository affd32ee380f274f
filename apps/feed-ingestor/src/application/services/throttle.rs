//! Log Throttle
//!
//! Limits how often a noisy warning is emitted. Occurrences inside the
//! quiet period are counted and reported with the next emitted line.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Rate limiter for a single log site.
#[derive(Debug)]
pub struct LogThrottle {
    period: Duration,
    last_emit: Mutex<Option<Instant>>,
    suppressed: AtomicU64,
}

impl LogThrottle {
    /// Allow at most one line per `period`.
    #[must_use]
    pub const fn new(period: Duration) -> Self {
        Self {
            period,
            last_emit: Mutex::new(None),
            suppressed: AtomicU64::new(0),
        }
    }

    /// Register an occurrence.
    ///
    /// Returns `Some(suppressed)` when the caller should log now, where
    /// `suppressed` is the number of occurrences swallowed since the last
    /// emitted line. Returns `None` when the line should be skipped.
    pub fn check(&self) -> Option<u64> {
        let now = Instant::now();
        let mut last_emit = self.last_emit.lock();

        let due = last_emit.is_none_or(|last| now.duration_since(last) >= self.period);
        if due {
            *last_emit = Some(now);
            drop(last_emit);
            Some(self.suppressed.swap(0, Ordering::Relaxed))
        } else {
            drop(last_emit);
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            None
        }
    }
}

impl Default for LogThrottle {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}
