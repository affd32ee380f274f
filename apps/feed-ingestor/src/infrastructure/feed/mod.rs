//! Feed Source Adapters
//!
//! Implementations of the `FeedSource` port:
//!
//! - `websocket`: push feed over WebSocket with reconnect and backoff
//! - `replay`: line-delimited payload file replayed from a reader thread
//!
//! Both publish their connection state through a shared `FeedHealth`.

pub mod replay;
pub mod websocket;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

pub use replay::ReplayFeed;
pub use websocket::{WebSocketFeed, WebSocketFeedConfig};

/// Connection state of a feed source, readable from any thread.
#[derive(Debug)]
pub struct FeedHealth {
    source: &'static str,
    connected: AtomicBool,
    payloads_delivered: AtomicU64,
    payloads_rejected: AtomicU64,
    reconnects: AtomicU64,
    last_payload_at: RwLock<Option<DateTime<Utc>>>,
}

impl FeedHealth {
    /// Create state for a named source.
    #[must_use]
    pub const fn new(source: &'static str) -> Self {
        Self {
            source,
            connected: AtomicBool::new(false),
            payloads_delivered: AtomicU64::new(0),
            payloads_rejected: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            last_payload_at: RwLock::new(None),
        }
    }

    /// Source name.
    #[must_use]
    pub const fn source(&self) -> &'static str {
        self.source
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
        crate::infrastructure::metrics::set_feed_connected(self.source, connected);
    }

    pub(crate) fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
        crate::infrastructure::metrics::record_feed_reconnect(self.source);
    }

    /// Count a payload handed to the sink.
    pub(crate) fn record_payload(&self, accepted: bool) {
        if accepted {
            self.payloads_delivered.fetch_add(1, Ordering::Relaxed);
        } else {
            self.payloads_rejected.fetch_add(1, Ordering::Relaxed);
        }
        *self.last_payload_at.write() = Some(Utc::now());
    }

    /// Check whether the source is currently connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Point-in-time copy.
    #[must_use]
    pub fn snapshot(&self) -> FeedHealthSnapshot {
        FeedHealthSnapshot {
            source: self.source,
            connected: self.is_connected(),
            payloads_delivered: self.payloads_delivered.load(Ordering::Relaxed),
            payloads_rejected: self.payloads_rejected.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            last_payload_at: *self.last_payload_at.read(),
        }
    }
}

/// Serializable feed state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedHealthSnapshot {
    /// Source name.
    pub source: &'static str,
    /// Whether the source is connected.
    pub connected: bool,
    /// Payloads the engine accepted.
    pub payloads_delivered: u64,
    /// Payloads the engine rejected.
    pub payloads_rejected: u64,
    /// Reconnection attempts.
    pub reconnects: u64,
    /// Time of the last payload.
    pub last_payload_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_tracks_payloads_and_connection() {
        let health = FeedHealth::new("test");
        assert!(!health.is_connected());

        health.set_connected(true);
        health.record_payload(true);
        health.record_payload(false);
        health.record_reconnect();

        let snapshot = health.snapshot();
        assert!(snapshot.connected);
        assert_eq!(snapshot.payloads_delivered, 1);
        assert_eq!(snapshot.payloads_rejected, 1);
        assert_eq!(snapshot.reconnects, 1);
        assert!(snapshot.last_payload_at.is_some());
    }
}
