//! Instrument Directory Port (Driven Port)
//!
//! Read-only view of which instruments are subscribed, used by the parser
//! to filter and complete feed elements.

use crate::domain::subscription::{ExchangeSegment, InstrumentKey, SubscriptionSet};

/// Lookup of subscribed instruments.
pub trait InstrumentDirectory: Send + Sync {
    /// Check whether an instrument is subscribed.
    fn is_subscribed(&self, key: &InstrumentKey) -> bool;

    /// Resolve a token, and the exchange when the feed sent one, to a
    /// subscribed instrument.
    fn resolve(&self, token: &str, exchange: Option<&ExchangeSegment>) -> Option<InstrumentKey>;

    /// Trading symbol registered for an instrument.
    fn symbol_for(&self, key: &InstrumentKey) -> Option<String>;
}

impl InstrumentDirectory for SubscriptionSet {
    fn is_subscribed(&self, key: &InstrumentKey) -> bool {
        self.contains(key)
    }

    fn resolve(&self, token: &str, exchange: Option<&ExchangeSegment>) -> Option<InstrumentKey> {
        Self::resolve(self, token, exchange)
    }

    fn symbol_for(&self, key: &InstrumentKey) -> Option<String> {
        Self::symbol_for(self, key)
    }
}
