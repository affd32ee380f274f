//! Market Data Streaming Types
//!
//! Core domain types for ingested market data: the raw payload handed over by
//! a feed source and the parsed per-instrument record that is persisted.
//! These types are codec-agnostic; decoding lives in the application layer.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::subscription::{ExchangeSegment, InstrumentKey};

// =============================================================================
// Raw Message
// =============================================================================

/// An opaque payload delivered by a feed source, stamped on arrival.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Payload exactly as delivered.
    pub payload: String,
    /// Wall-clock time the payload reached the ingestor.
    pub received_at: DateTime<Utc>,
}

impl RawMessage {
    /// Stamp a payload with the current time.
    #[must_use]
    pub fn new(payload: impl Into<String>) -> Self {
        Self::at(payload, Utc::now())
    }

    /// Stamp a payload with an explicit arrival time.
    #[must_use]
    pub fn at(payload: impl Into<String>, received_at: DateTime<Utc>) -> Self {
        Self {
            payload: payload.into(),
            received_at,
        }
    }

    /// Payload length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Check whether the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

// =============================================================================
// Feed Record
// =============================================================================

/// One instrument update parsed from a feed message.
///
/// Every market field is optional: a value the feed did not send, or sent in
/// a shape that could not be converted, is `None` rather than zero so that
/// downstream aggregates are not skewed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedRecord {
    /// Arrival time of the message this record came from.
    pub received_at: DateTime<Utc>,
    /// Instrument the update refers to.
    pub instrument: InstrumentKey,
    /// Trading symbol, when sent by the feed or known to the directory.
    pub symbol: Option<String>,
    /// Last traded price.
    pub last_price: Option<Decimal>,
    /// Last traded quantity.
    pub last_quantity: Option<i64>,
    /// Cumulative traded volume.
    pub volume: Option<i64>,
    /// Cumulative turnover.
    pub turnover: Option<Decimal>,
    /// Absolute change versus previous close.
    pub change_amount: Option<Decimal>,
    /// Percentage change versus previous close.
    pub change_percent: Option<Decimal>,
    /// Best bid price.
    pub bid_price: Option<Decimal>,
    /// Best ask price.
    pub ask_price: Option<Decimal>,
    /// Best bid quantity.
    pub bid_quantity: Option<i64>,
    /// Best ask quantity.
    pub ask_quantity: Option<i64>,
    /// Aggregate buy quantity across the book.
    pub total_buy_quantity: Option<i64>,
    /// Aggregate sell quantity across the book.
    pub total_sell_quantity: Option<i64>,
    /// Exchange time of the last trade.
    pub last_trade_time: Option<DateTime<Utc>>,
    /// Time the feed generated this update.
    pub feed_time: Option<DateTime<Utc>>,
    /// The element of the original payload this record was built from.
    pub raw: serde_json::Value,
}

impl FeedRecord {
    /// Create a record with only identity fields set.
    #[must_use]
    pub fn new(instrument: InstrumentKey, received_at: DateTime<Utc>) -> Self {
        Self {
            received_at,
            instrument,
            symbol: None,
            last_price: None,
            last_quantity: None,
            volume: None,
            turnover: None,
            change_amount: None,
            change_percent: None,
            bid_price: None,
            ask_price: None,
            bid_quantity: None,
            ask_quantity: None,
            total_buy_quantity: None,
            total_sell_quantity: None,
            last_trade_time: None,
            feed_time: None,
            raw: serde_json::Value::Null,
        }
    }

    /// Instrument token.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.instrument.token
    }

    /// Exchange segment.
    #[must_use]
    pub const fn exchange(&self) -> &ExchangeSegment {
        &self.instrument.exchange
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_message_len() {
        let raw = RawMessage::new("[Res]: []");
        assert_eq!(raw.len(), 9);
        assert!(!raw.is_empty());
        assert!(RawMessage::new("").is_empty());
    }

    #[test]
    fn new_record_has_unknown_market_fields() {
        let key = InstrumentKey::new("2885", ExchangeSegment::NseCm);
        let record = FeedRecord::new(key, Utc::now());

        assert_eq!(record.token(), "2885");
        assert_eq!(record.exchange(), &ExchangeSegment::NseCm);
        assert!(record.last_price.is_none());
        assert!(record.volume.is_none());
        assert!(record.raw.is_null());
    }
}
