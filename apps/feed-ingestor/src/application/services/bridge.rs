//! Bridge Queue
//!
//! Bounded hand-off between the feed's delivery context and the engine's
//! processing task. Producers call `enqueue` from any thread without an async
//! runtime; the single consumer awaits `dequeue`.
//!
//! When full, the configured `OverflowPolicy` decides which payload is
//! dropped. Overflow is never an error: it is counted and logged through a
//! throttle.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;

use super::throttle::LogThrottle;
use crate::application::ports::FeedSink;
use crate::domain::streaming::RawMessage;
use crate::infrastructure::metrics::{self, DropReason};

// =============================================================================
// Overflow Policy
// =============================================================================

/// Which payload to drop when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Reject the incoming payload.
    #[default]
    DropNewest,
    /// Evict the oldest queued payload to make room.
    DropOldest,
}

impl OverflowPolicy {
    /// Parse from string (case-insensitive).
    ///
    /// Returns `None` for unrecognized values.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Option<Self> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "drop-newest" | "newest" => Some(Self::DropNewest),
            "drop-oldest" | "oldest" => Some(Self::DropOldest),
            _ => None,
        }
    }

    /// Returns the string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DropNewest => "drop-newest",
            Self::DropOldest => "drop-oldest",
        }
    }
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Enqueue Result
// =============================================================================

/// Result of offering a payload to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    /// Payload queued.
    Accepted,
    /// Payload queued after evicting the oldest one.
    AcceptedWithEviction,
    /// Queue full under `DropNewest`; payload dropped.
    RejectedFull,
    /// Queue closed; payload dropped.
    RejectedClosed,
}

impl EnqueueResult {
    /// Check whether the offered payload is now queued.
    #[must_use]
    pub const fn is_accepted(self) -> bool {
        matches!(self, Self::Accepted | Self::AcceptedWithEviction)
    }
}

// =============================================================================
// Bridge Statistics
// =============================================================================

/// Snapshot of queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BridgeStats {
    /// Payloads accepted.
    pub enqueued: u64,
    /// Payloads handed to the consumer.
    pub dequeued: u64,
    /// Payloads dropped by the overflow policy.
    pub overflow_dropped: u64,
    /// Payloads rejected after close.
    pub rejected_closed: u64,
    /// Payloads currently queued.
    pub depth: usize,
    /// Maximum queued payloads.
    pub capacity: usize,
}

// =============================================================================
// Bridge Queue
// =============================================================================

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<RawMessage>,
    closed: bool,
}

/// Bounded multi-producer, single-consumer payload queue.
///
/// # Example
///
/// ```rust
/// use feed_ingestor::application::services::bridge::{BridgeQueue, OverflowPolicy};
/// use feed_ingestor::domain::streaming::RawMessage;
///
/// let queue = BridgeQueue::new(2, OverflowPolicy::DropOldest);
/// queue.enqueue(RawMessage::new("a"));
/// queue.enqueue(RawMessage::new("b"));
/// queue.enqueue(RawMessage::new("c"));
///
/// assert_eq!(queue.try_dequeue().map(|m| m.payload).as_deref(), Some("b"));
/// assert_eq!(queue.stats().overflow_dropped, 1);
/// ```
#[derive(Debug)]
pub struct BridgeQueue {
    state: Mutex<QueueState>,
    available: Notify,
    capacity: usize,
    policy: OverflowPolicy,
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    overflow_dropped: AtomicU64,
    rejected_closed: AtomicU64,
    overflow_log: LogThrottle,
}

impl BridgeQueue {
    /// Create a queue. A capacity of zero is raised to one.
    #[must_use]
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity.min(4096)),
                closed: false,
            }),
            available: Notify::new(),
            capacity,
            policy,
            enqueued: AtomicU64::new(0),
            dequeued: AtomicU64::new(0),
            overflow_dropped: AtomicU64::new(0),
            rejected_closed: AtomicU64::new(0),
            overflow_log: LogThrottle::default(),
        }
    }

    /// Offer a payload. Never blocks beyond a short lock.
    pub fn enqueue(&self, message: RawMessage) -> EnqueueResult {
        let mut state = self.state.lock();

        if state.closed {
            drop(state);
            self.rejected_closed.fetch_add(1, Ordering::Relaxed);
            metrics::record_dropped(DropReason::Closed, 1);
            return EnqueueResult::RejectedClosed;
        }

        let result = if state.items.len() < self.capacity {
            state.items.push_back(message);
            EnqueueResult::Accepted
        } else {
            match self.policy {
                OverflowPolicy::DropNewest => EnqueueResult::RejectedFull,
                OverflowPolicy::DropOldest => {
                    state.items.pop_front();
                    state.items.push_back(message);
                    EnqueueResult::AcceptedWithEviction
                }
            }
        };
        let depth = state.items.len();
        drop(state);

        match result {
            EnqueueResult::Accepted => {}
            EnqueueResult::AcceptedWithEviction => self.note_overflow(DropReason::OverflowOldest),
            EnqueueResult::RejectedFull => {
                self.note_overflow(DropReason::OverflowNewest);
                return result;
            }
            EnqueueResult::RejectedClosed => return result,
        }

        self.enqueued.fetch_add(1, Ordering::Relaxed);
        metrics::record_message_received();
        metrics::set_queue_depth(depth);
        self.available.notify_one();
        result
    }

    /// Wait for the next payload in FIFO order.
    ///
    /// Returns `None` once the queue is closed and empty.
    pub async fn dequeue(&self) -> Option<RawMessage> {
        loop {
            let notified = self.available.notified();
            {
                let mut state = self.state.lock();
                if let Some(message) = state.items.pop_front() {
                    let depth = state.items.len();
                    drop(state);
                    self.dequeued.fetch_add(1, Ordering::Relaxed);
                    metrics::set_queue_depth(depth);
                    return Some(message);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Pop the next payload without waiting.
    pub fn try_dequeue(&self) -> Option<RawMessage> {
        let mut state = self.state.lock();
        let message = state.items.pop_front()?;
        let depth = state.items.len();
        drop(state);

        self.dequeued.fetch_add(1, Ordering::Relaxed);
        metrics::set_queue_depth(depth);
        Some(message)
    }

    /// Stop accepting payloads and wake the consumer.
    ///
    /// Already queued payloads remain available to `dequeue`.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.available.notify_waiters();
        self.available.notify_one();
    }

    /// Check whether the queue was closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Payloads currently queued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Check whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum queued payloads.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Configured overflow policy.
    #[must_use]
    pub const fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Snapshot of the queue counters.
    #[must_use]
    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dequeued: self.dequeued.load(Ordering::Relaxed),
            overflow_dropped: self.overflow_dropped.load(Ordering::Relaxed),
            rejected_closed: self.rejected_closed.load(Ordering::Relaxed),
            depth: self.len(),
            capacity: self.capacity,
        }
    }

    /// Build a feed sink that enqueues into this queue.
    #[must_use]
    pub fn sink(self: &Arc<Self>) -> FeedSink {
        let queue = Arc::clone(self);
        FeedSink::new(move |message| queue.enqueue(message).is_accepted())
    }

    fn note_overflow(&self, reason: DropReason) {
        let total = self.overflow_dropped.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::record_dropped(reason, 1);

        if let Some(suppressed) = self.overflow_log.check() {
            tracing::warn!(
                policy = %self.policy,
                capacity = self.capacity,
                overflow_total = total,
                suppressed,
                "Bridge queue full, dropping payload"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn payloads(queue: &BridgeQueue) -> Vec<String> {
        std::iter::from_fn(|| queue.try_dequeue())
            .map(|message| message.payload)
            .collect()
    }

    #[test]
    fn overflow_policy_from_str() {
        assert_eq!(
            OverflowPolicy::from_str_case_insensitive("DROP-NEWEST"),
            Some(OverflowPolicy::DropNewest)
        );
        assert_eq!(
            OverflowPolicy::from_str_case_insensitive("drop_oldest"),
            Some(OverflowPolicy::DropOldest)
        );
        assert_eq!(OverflowPolicy::from_str_case_insensitive("block"), None);
        assert_eq!(OverflowPolicy::default(), OverflowPolicy::DropNewest);
    }

    #[test]
    fn fifo_order() {
        let queue = BridgeQueue::new(10, OverflowPolicy::DropNewest);
        for payload in ["a", "b", "c"] {
            assert_eq!(queue.enqueue(RawMessage::new(payload)), EnqueueResult::Accepted);
        }
        assert_eq!(payloads(&queue), vec!["a", "b", "c"]);
    }

    #[test]
    fn drop_newest_rejects_incoming() {
        let queue = BridgeQueue::new(2, OverflowPolicy::DropNewest);
        queue.enqueue(RawMessage::new("a"));
        queue.enqueue(RawMessage::new("b"));

        assert_eq!(queue.enqueue(RawMessage::new("c")), EnqueueResult::RejectedFull);
        assert_eq!(payloads(&queue), vec!["a", "b"]);

        let stats = queue.stats();
        assert_eq!(stats.enqueued, 2);
        assert_eq!(stats.overflow_dropped, 1);
    }

    #[test]
    fn drop_oldest_evicts_head() {
        let queue = BridgeQueue::new(2, OverflowPolicy::DropOldest);
        for payload in ["a", "b", "c", "d"] {
            assert!(queue.enqueue(RawMessage::new(payload)).is_accepted());
        }

        assert_eq!(payloads(&queue), vec!["c", "d"]);
        assert_eq!(queue.stats().overflow_dropped, 2);
    }

    #[test]
    fn zero_capacity_is_raised_to_one() {
        let queue = BridgeQueue::new(0, OverflowPolicy::DropNewest);
        assert_eq!(queue.capacity(), 1);
        assert!(queue.enqueue(RawMessage::new("a")).is_accepted());
        assert!(!queue.enqueue(RawMessage::new("b")).is_accepted());
    }

    #[test]
    fn closed_queue_rejects_and_counts() {
        let queue = BridgeQueue::new(4, OverflowPolicy::DropNewest);
        queue.enqueue(RawMessage::new("a"));
        queue.close();

        assert_eq!(queue.enqueue(RawMessage::new("b")), EnqueueResult::RejectedClosed);
        assert_eq!(queue.stats().rejected_closed, 1);
        assert_eq!(queue.stats().overflow_dropped, 0);
        assert_eq!(payloads(&queue), vec!["a"]);
    }

    #[tokio::test]
    async fn dequeue_drains_then_ends_after_close() {
        let queue = BridgeQueue::new(4, OverflowPolicy::DropNewest);
        queue.enqueue(RawMessage::new("a"));
        queue.close();

        assert_eq!(queue.dequeue().await.map(|m| m.payload).as_deref(), Some("a"));
        assert!(queue.dequeue().await.is_none());
    }

    #[tokio::test]
    async fn dequeue_wakes_on_enqueue_from_thread() {
        let queue = Arc::new(BridgeQueue::new(4, OverflowPolicy::DropNewest));
        let producer = Arc::clone(&queue);

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.enqueue(RawMessage::new("late"));
        });

        let message = tokio::time::timeout(Duration::from_secs(5), queue.dequeue())
            .await
            .unwrap();
        assert_eq!(message.map(|m| m.payload).as_deref(), Some("late"));
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn close_wakes_waiting_consumer() {
        let queue = Arc::new(BridgeQueue::new(4, OverflowPolicy::DropNewest));
        let consumer = Arc::clone(&queue);

        let waiter = tokio::spawn(async move { consumer.dequeue().await });
        tokio::task::yield_now().await;
        queue.close();

        let result = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn sink_reports_acceptance() {
        let queue = Arc::new(BridgeQueue::new(1, OverflowPolicy::DropNewest));
        let sink = queue.sink();

        assert!(sink.deliver("a"));
        assert!(!sink.deliver("b"));
        assert_eq!(queue.len(), 1);
    }
}
