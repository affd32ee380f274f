//! In-Memory Feed Store
//!
//! Keeps committed batches in process. Used by `INGEST_STORE=memory` dry runs
//! and by tests, which can inject write failures and latency and inspect how
//! many writes were ever in flight at once.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use crate::application::ports::{FeedStore, StoreError};
use crate::domain::stats::IngestionStats;
use crate::domain::streaming::FeedRecord;

/// `FeedStore` held in memory.
#[derive(Debug, Default)]
pub struct InMemoryFeedStore {
    batches: RwLock<Vec<Vec<FeedRecord>>>,
    stats: Mutex<Option<IngestionStats>>,
    write_delay: RwLock<Duration>,
    fail_next_writes: AtomicU32,
    fail_all_writes: AtomicBool,
    fail_stats: AtomicBool,
    fail_load: AtomicBool,
    write_attempts: AtomicU64,
    stats_upserts: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl InMemoryFeedStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store whose statistics row already exists.
    #[must_use]
    pub fn with_stats(stats: IngestionStats) -> Self {
        let store = Self::default();
        *store.stats.lock() = Some(stats);
        store
    }

    /// Hold every write for `delay` before completing it.
    pub fn set_write_delay(&self, delay: Duration) {
        *self.write_delay.write() = delay;
    }

    /// Fail the next `count` write attempts.
    pub fn fail_next_writes(&self, count: u32) {
        self.fail_next_writes.store(count, Ordering::SeqCst);
    }

    /// Fail every write attempt until switched off.
    pub fn set_fail_all_writes(&self, fail: bool) {
        self.fail_all_writes.store(fail, Ordering::SeqCst);
    }

    /// Fail statistics upserts until switched off.
    pub fn set_fail_stats(&self, fail: bool) {
        self.fail_stats.store(fail, Ordering::SeqCst);
    }

    /// Fail statistics loads until switched off.
    pub fn set_fail_load(&self, fail: bool) {
        self.fail_load.store(fail, Ordering::SeqCst);
    }

    /// Committed batches, in commit order.
    #[must_use]
    pub fn batches(&self) -> Vec<Vec<FeedRecord>> {
        self.batches.read().clone()
    }

    /// Sizes of committed batches, in commit order.
    #[must_use]
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.read().iter().map(Vec::len).collect()
    }

    /// All committed records, flattened.
    #[must_use]
    pub fn records(&self) -> Vec<FeedRecord> {
        self.batches.read().iter().flatten().cloned().collect()
    }

    /// Committed record count.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.batches.read().iter().map(Vec::len).sum()
    }

    /// Stored statistics row.
    #[must_use]
    pub fn stored_stats(&self) -> Option<IngestionStats> {
        self.stats.lock().clone()
    }

    /// Write attempts received, failed ones included.
    #[must_use]
    pub fn write_attempts(&self) -> u64 {
        self.write_attempts.load(Ordering::SeqCst)
    }

    /// Successful statistics upserts.
    #[must_use]
    pub fn stats_upserts(&self) -> u64 {
        self.stats_upserts.load(Ordering::SeqCst)
    }

    /// Highest number of writes observed in flight at once.
    #[must_use]
    pub fn max_concurrent_writes(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn should_fail_write(&self) -> bool {
        if self.fail_all_writes.load(Ordering::SeqCst) {
            return true;
        }
        self.fail_next_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl FeedStore for InMemoryFeedStore {
    async fn write_batch(&self, records: &[FeedRecord]) -> Result<(), StoreError> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        let concurrent = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlightGuard(&self.in_flight);
        self.max_in_flight.fetch_max(concurrent, Ordering::SeqCst);

        let delay = *self.write_delay.read();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.should_fail_write() {
            return Err(StoreError::unavailable("injected write failure"));
        }

        self.batches.write().push(records.to_vec());
        Ok(())
    }

    async fn upsert_stats(&self, stats: &IngestionStats) -> Result<(), StoreError> {
        if self.fail_stats.load(Ordering::SeqCst) {
            return Err(StoreError::query("injected stats failure"));
        }
        *self.stats.lock() = Some(stats.clone());
        self.stats_upserts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn load_stats(&self) -> Result<Option<IngestionStats>, StoreError> {
        if self.fail_load.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("injected load failure"));
        }
        Ok(self.stats.lock().clone())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::domain::subscription::{ExchangeSegment, InstrumentKey};

    fn record(token: &str) -> FeedRecord {
        FeedRecord::new(InstrumentKey::new(token, ExchangeSegment::NseCm), Utc::now())
    }

    #[tokio::test]
    async fn commits_batches_in_order() {
        let store = InMemoryFeedStore::new();
        store.write_batch(&[record("1"), record("2")]).await.unwrap();
        store.write_batch(&[record("3")]).await.unwrap();

        assert_eq!(store.batch_sizes(), vec![2, 1]);
        assert_eq!(store.record_count(), 3);
        assert_eq!(store.records()[2].token(), "3");
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let store = InMemoryFeedStore::new();
        store.fail_next_writes(2);

        assert!(store.write_batch(&[record("1")]).await.is_err());
        assert!(store.write_batch(&[record("1")]).await.is_err());
        assert!(store.write_batch(&[record("1")]).await.is_ok());
        assert_eq!(store.write_attempts(), 3);
        assert_eq!(store.record_count(), 1);
    }

    #[tokio::test]
    async fn stats_round_trip() {
        let store = InMemoryFeedStore::new();
        assert!(store.load_stats().await.unwrap().is_none());

        let stats = IngestionStats {
            records_processed: 9,
            ..IngestionStats::default()
        };
        store.upsert_stats(&stats).await.unwrap();
        assert_eq!(store.load_stats().await.unwrap(), Some(stats));

        store.set_fail_stats(true);
        assert!(store.upsert_stats(&IngestionStats::default()).await.is_err());
        assert_eq!(store.stats_upserts(), 1);
    }
}
