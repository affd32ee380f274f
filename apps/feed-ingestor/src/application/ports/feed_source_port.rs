//! Feed Source Port (Driver Port)
//!
//! A feed source pushes raw payloads into the engine from a context the
//! engine does not control: a socket task, a reader thread, a vendor
//! callback. The only thing it is handed is a `FeedSink`.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::streaming::RawMessage;
use crate::domain::subscription::InstrumentKey;

type Deliver = dyn Fn(RawMessage) -> bool + Send + Sync;

/// Cloneable callback handed to a feed source.
///
/// `deliver` never blocks and never fails loudly: a payload the engine cannot
/// accept is counted on the engine side and `false` is returned.
#[derive(Clone)]
pub struct FeedSink {
    deliver: Arc<Deliver>,
}

impl FeedSink {
    /// Wrap a delivery callback.
    pub fn new<F>(deliver: F) -> Self
    where
        F: Fn(RawMessage) -> bool + Send + Sync + 'static,
    {
        Self {
            deliver: Arc::new(deliver),
        }
    }

    /// Deliver a payload, stamping it with the current time.
    ///
    /// Returns whether the payload was accepted.
    pub fn deliver(&self, payload: impl Into<String>) -> bool {
        (self.deliver)(RawMessage::new(payload))
    }

    /// Deliver an already stamped message.
    pub fn deliver_message(&self, message: RawMessage) -> bool {
        (self.deliver)(message)
    }
}

impl fmt::Debug for FeedSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedSink").finish_non_exhaustive()
    }
}

/// Feed source error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FeedSourceError {
    /// The source could not reach its upstream.
    #[error("feed connection error: {message}")]
    Connection {
        /// Error details.
        message: String,
    },

    /// The source is already delivering into a sink.
    #[error("feed source is already subscribed")]
    AlreadySubscribed,

    /// The source's input could not be opened.
    #[error("feed input unavailable: {message}")]
    Unavailable {
        /// Error details.
        message: String,
    },
}

/// Push feed of raw market-data payloads.
#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Start delivering payloads for the given instruments into `sink`.
    async fn subscribe(
        &self,
        instruments: &[InstrumentKey],
        sink: FeedSink,
    ) -> Result<(), FeedSourceError>;

    /// Stop delivering. After this returns the sink receives nothing more.
    async fn unsubscribe(&self) -> Result<(), FeedSourceError>;

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}
