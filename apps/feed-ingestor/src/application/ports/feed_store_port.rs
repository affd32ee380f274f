//! Feed Store Port (Driven Port)
//!
//! Durable storage for parsed records and the single cumulative statistics
//! row. A batch write is all-or-nothing.

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::stats::IngestionStats;
use crate::domain::streaming::FeedRecord;

/// Store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("store unavailable: {message}")]
    Unavailable {
        /// Error details.
        message: String,
    },

    /// A statement or transaction failed.
    #[error("store query failed: {message}")]
    Query {
        /// Error details.
        message: String,
    },

    /// The call did not complete before its deadline.
    #[error("store call timed out after {timeout:?}")]
    TimedOut {
        /// Deadline that elapsed.
        timeout: Duration,
    },

    /// A stored value could not be converted.
    #[error("store data invalid: {message}")]
    InvalidData {
        /// Error details.
        message: String,
    },
}

impl StoreError {
    /// Create an unavailable error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Create a query error.
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
        }
    }
}

/// Port for record and statistics persistence.
#[async_trait]
pub trait FeedStore: Send + Sync {
    /// Persist a whole batch in one transaction.
    async fn write_batch(&self, records: &[FeedRecord]) -> Result<(), StoreError>;

    /// Insert or replace the statistics row.
    async fn upsert_stats(&self, stats: &IngestionStats) -> Result<(), StoreError>;

    /// Load the statistics row, if one was ever written.
    async fn load_stats(&self) -> Result<Option<IngestionStats>, StoreError>;
}
