//! Message Parser
//!
//! Decodes one feed payload into zero or more `FeedRecord`s.
//!
//! # Envelope
//!
//! Payloads carry a `[Res]:` prefix followed by a JSON body. The body is one of:
//!
//! ```json
//! [{"tk":"2885","e":"nse_cm","ltp":"1450.25"}, ...]
//! {"type":"stock_feed","data":[{"tk":"2885", ...}, ...]}
//! {"tk":"2885","e":"nse_cm","ltp":"1450.25"}
//! ```
//!
//! Any other object (acks, heartbeats) is ignored. A body that is not JSON,
//! or JSON that is neither an array nor an object, is an envelope error.
//!
//! # Elements
//!
//! Each element is decoded on its own. Field values may be strings or
//! numbers; empty or unconvertible values become `None`. Elements without a
//! token are malformed, elements for instruments outside the directory are
//! unsubscribed, and neither stops the rest of the message from decoding.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde_json::{Map, Value};

use crate::application::ports::InstrumentDirectory;
use crate::domain::streaming::{FeedRecord, RawMessage};
use crate::domain::subscription::ExchangeSegment;

/// Prefix carried by every feed payload.
pub const ENVELOPE_PREFIX: &str = "[Res]:";

/// Timestamp format used by `ltt` and `fdtm`.
pub const FEED_TIME_FORMAT: &str = "%d/%m/%Y %H:%M:%S";

// =============================================================================
// Errors and Outcomes
// =============================================================================

/// A payload whose envelope could not be decoded.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    /// The payload does not start with the `[Res]:` prefix.
    #[error("missing {ENVELOPE_PREFIX} prefix")]
    MissingPrefix,

    /// The body is not valid JSON.
    #[error("invalid JSON body: {0}")]
    Json(#[from] serde_json::Error),

    /// The body is valid JSON of an unexpected shape.
    #[error("unexpected body: {0}")]
    UnexpectedBody(String),
}

impl EnvelopeError {
    /// Short label for metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::MissingPrefix => "missing_prefix",
            Self::Json(_) => "invalid_json",
            Self::UnexpectedBody(_) => "unexpected_body",
        }
    }
}

/// Result of decoding one element.
#[derive(Debug, Clone, PartialEq)]
pub enum ElementOutcome {
    /// The element became a record.
    Record(Box<FeedRecord>),
    /// The element refers to an instrument that is not subscribed.
    Unsubscribed,
    /// The element is not an object or carries no token.
    Malformed,
}

/// Aggregate result of decoding one payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParseOutcome {
    /// Records in element order.
    pub records: Vec<FeedRecord>,
    /// Elements dropped because their instrument is not subscribed.
    pub unsubscribed: usize,
    /// Elements dropped as malformed.
    pub malformed: usize,
    /// The payload was a control frame with no market data.
    pub ignored: bool,
}

impl ParseOutcome {
    fn ignored() -> Self {
        Self {
            ignored: true,
            ..Self::default()
        }
    }

    fn push(&mut self, outcome: ElementOutcome) {
        match outcome {
            ElementOutcome::Record(record) => self.records.push(*record),
            ElementOutcome::Unsubscribed => self.unsubscribed += 1,
            ElementOutcome::Malformed => self.malformed += 1,
        }
    }

    /// Total elements seen.
    #[must_use]
    pub fn elements(&self) -> usize {
        self.records.len() + self.unsubscribed + self.malformed
    }
}

// =============================================================================
// Parser
// =============================================================================

/// Feed payload decoder bound to an instrument directory.
#[derive(Clone)]
pub struct MessageParser {
    directory: Arc<dyn InstrumentDirectory>,
}

impl std::fmt::Debug for MessageParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageParser").finish_non_exhaustive()
    }
}

impl MessageParser {
    /// Create a parser that filters against `directory`.
    #[must_use]
    pub fn new(directory: Arc<dyn InstrumentDirectory>) -> Self {
        Self { directory }
    }

    /// Decode a payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the envelope is malformed. Element-level problems
    /// are counted in the outcome instead.
    pub fn parse(&self, message: &RawMessage) -> Result<ParseOutcome, EnvelopeError> {
        let body = message
            .payload
            .trim_start()
            .strip_prefix(ENVELOPE_PREFIX)
            .ok_or(EnvelopeError::MissingPrefix)?
            .trim();

        let value: Value = serde_json::from_str(body)?;
        let received_at = message.received_at;

        match value {
            Value::Array(elements) => Ok(self.decode_elements(&elements, received_at)),
            Value::Object(object) => match object.get("data") {
                Some(Value::Array(elements)) => Ok(self.decode_elements(elements, received_at)),
                Some(other) => Err(EnvelopeError::UnexpectedBody(format!(
                    "data is {}, expected array",
                    json_kind(other)
                ))),
                None if object.contains_key("tk") => {
                    let mut outcome = ParseOutcome::default();
                    outcome.push(self.decode_object(&object, received_at));
                    Ok(outcome)
                }
                None => Ok(ParseOutcome::ignored()),
            },
            other => Err(EnvelopeError::UnexpectedBody(format!(
                "body is {}, expected array or object",
                json_kind(&other)
            ))),
        }
    }

    fn decode_elements(&self, elements: &[Value], received_at: DateTime<Utc>) -> ParseOutcome {
        let mut outcome = ParseOutcome {
            records: Vec::with_capacity(elements.len()),
            ..ParseOutcome::default()
        };
        for element in elements {
            outcome.push(self.decode_element(element, received_at));
        }
        outcome
    }

    /// Decode a single element.
    #[must_use]
    pub fn decode_element(&self, element: &Value, received_at: DateTime<Utc>) -> ElementOutcome {
        match element {
            Value::Object(object) => self.decode_object(object, received_at),
            _ => ElementOutcome::Malformed,
        }
    }

    fn decode_object(
        &self,
        object: &Map<String, Value>,
        received_at: DateTime<Utc>,
    ) -> ElementOutcome {
        let Some(token) = object.get("tk").and_then(text) else {
            return ElementOutcome::Malformed;
        };

        let exchange = object
            .get("e")
            .and_then(text)
            .map(|e| ExchangeSegment::from_str_case_insensitive(&e));

        let Some(instrument) = self.directory.resolve(&token, exchange.as_ref()) else {
            return ElementOutcome::Unsubscribed;
        };

        let field = |name: &str| object.get(name);

        let mut record = FeedRecord::new(instrument, received_at);
        record.symbol = field("ts")
            .and_then(text)
            .or_else(|| self.directory.symbol_for(&record.instrument));
        record.last_price = field("ltp").and_then(decimal);
        record.last_quantity = field("ltq").and_then(integer);
        record.volume = field("v").and_then(integer);
        record.turnover = field("to").and_then(decimal);
        record.change_amount = field("cng").and_then(decimal);
        record.change_percent = field("nc").and_then(decimal);
        record.bid_price = field("bp").and_then(decimal);
        record.ask_price = field("sp").and_then(decimal);
        record.bid_quantity = field("bq").and_then(integer);
        record.ask_quantity = field("bs").and_then(integer);
        record.total_buy_quantity = field("tbq").and_then(integer);
        record.total_sell_quantity = field("tsq").and_then(integer);
        record.last_trade_time = field("ltt").and_then(feed_time);
        record.feed_time = field("fdtm").and_then(feed_time);
        record.raw = Value::Object(object.clone());

        ElementOutcome::Record(Box::new(record))
    }
}

// =============================================================================
// Field Conversion
// =============================================================================

/// Non-empty text from a string or number.
fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_decimal(s: &str) -> Option<Decimal> {
    Decimal::from_str(s)
        .or_else(|_| Decimal::from_scientific(s))
        .ok()
}

fn decimal(value: &Value) -> Option<Decimal> {
    parse_decimal(&text(value)?)
}

fn integer(value: &Value) -> Option<i64> {
    if let Value::Number(n) = value
        && let Some(i) = n.as_i64()
    {
        return Some(i);
    }

    let s = text(value)?;
    s.parse::<i64>().ok().or_else(|| {
        let d = parse_decimal(&s)?;
        if d.fract().is_zero() { d.to_i64() } else { None }
    })
}

fn feed_time(value: &Value) -> Option<DateTime<Utc>> {
    let s = text(value)?;
    NaiveDateTime::parse_from_str(&s, FEED_TIME_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

const fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use test_case::test_case;

    use super::*;
    use crate::domain::subscription::{InstrumentKey, SubscribedInstrument, SubscriptionSet};

    fn parser() -> MessageParser {
        let set = SubscriptionSet::from_instruments([
            SubscribedInstrument::new(InstrumentKey::new("2885", ExchangeSegment::NseCm))
                .with_symbol("RELIANCE-EQ"),
            SubscribedInstrument::new(InstrumentKey::new("11536", ExchangeSegment::NseCm)),
            SubscribedInstrument::new(InstrumentKey::new("500325", ExchangeSegment::BseCm)),
            SubscribedInstrument::new(InstrumentKey::new("500325", ExchangeSegment::NseCm)),
        ]);
        MessageParser::new(Arc::new(set))
    }

    fn parse(payload: &str) -> Result<ParseOutcome, EnvelopeError> {
        parser().parse(&RawMessage::new(payload))
    }

    #[test]
    fn subscribed_element_kept_unsubscribed_dropped() {
        let outcome = parse(
            r#"[Res]: {"type":"stock_feed","data":[{"tk":"2885","ltp":"1450.25"},{"tk":"99999","ltp":"10"}]}"#,
        )
        .unwrap();

        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.unsubscribed, 1);
        assert_eq!(outcome.malformed, 0);

        let record = &outcome.records[0];
        assert_eq!(record.token(), "2885");
        assert_eq!(record.exchange(), &ExchangeSegment::NseCm);
        assert_eq!(record.last_price, Some(dec!(1450.25)));
        assert_eq!(record.symbol.as_deref(), Some("RELIANCE-EQ"));
    }

    #[test]
    fn full_element_maps_every_field() {
        let outcome = parse(
            r#"[Res]: [{"ts":"TCS-EQ","tk":"11536","e":"nse_cm","ltp":"3890.10","ltq":"5",
                "v":"120034","to":"466912345.5","cng":"-12.35","nc":"-0.32","bp":"3890.00",
                "sp":"3890.20","bq":"40","bs":"15","tbq":"99000","tsq":"101000",
                "ltt":"15/03/2024 10:15:30","fdtm":"15/03/2024 10:15:31"}]"#,
        )
        .unwrap();

        let record = &outcome.records[0];
        assert_eq!(record.symbol.as_deref(), Some("TCS-EQ"));
        assert_eq!(record.last_price, Some(dec!(3890.10)));
        assert_eq!(record.last_quantity, Some(5));
        assert_eq!(record.volume, Some(120_034));
        assert_eq!(record.turnover, Some(dec!(466912345.5)));
        assert_eq!(record.change_amount, Some(dec!(-12.35)));
        assert_eq!(record.change_percent, Some(dec!(-0.32)));
        assert_eq!(record.bid_price, Some(dec!(3890.00)));
        assert_eq!(record.ask_price, Some(dec!(3890.20)));
        assert_eq!(record.bid_quantity, Some(40));
        assert_eq!(record.ask_quantity, Some(15));
        assert_eq!(record.total_buy_quantity, Some(99_000));
        assert_eq!(record.total_sell_quantity, Some(101_000));
        assert_eq!(
            record.last_trade_time,
            Some(Utc.with_ymd_and_hms(2024, 3, 15, 10, 15, 30).unwrap())
        );
        assert_eq!(
            record.feed_time,
            Some(Utc.with_ymd_and_hms(2024, 3, 15, 10, 15, 31).unwrap())
        );
        assert_eq!(record.raw["tk"], json!("11536"));
    }

    #[test]
    fn missing_fields_are_unknown() {
        let outcome = parse(r#"[Res]: [{"tk":"11536","ltp":"","v":"n/a","ltt":"yesterday"}]"#).unwrap();
        let record = &outcome.records[0];

        assert!(record.last_price.is_none());
        assert!(record.volume.is_none());
        assert!(record.last_trade_time.is_none());
        assert!(record.bid_price.is_none());
        assert!(record.symbol.is_none());
    }

    #[test_case(json!("1450.25"), Some(dec!(1450.25)) ; "string")]
    #[test_case(json!(1450.25), Some(dec!(1450.25)) ; "number")]
    #[test_case(json!(7), Some(dec!(7)) ; "integer")]
    #[test_case(json!("1.5e2"), Some(dec!(150)) ; "scientific")]
    #[test_case(json!(""), None ; "empty")]
    #[test_case(json!("abc"), None ; "garbage")]
    #[test_case(json!(null), None ; "null")]
    #[test_case(json!(true), None ; "boolean")]
    fn decimal_conversion(value: Value, expected: Option<Decimal>) {
        assert_eq!(decimal(&value), expected);
    }

    #[test_case(json!("120"), Some(120) ; "string")]
    #[test_case(json!(120), Some(120) ; "number")]
    #[test_case(json!("120.0"), Some(120) ; "whole decimal string")]
    #[test_case(json!(120.0), Some(120) ; "whole float")]
    #[test_case(json!("120.5"), None ; "fractional")]
    #[test_case(json!(" "), None ; "blank")]
    fn integer_conversion(value: Value, expected: Option<i64>) {
        assert_eq!(integer(&value), expected);
    }

    #[test]
    fn numeric_token_accepted() {
        let outcome = parse(r#"[Res]: [{"tk":2885,"e":"nse_cm","ltp":1450.25}]"#).unwrap();
        assert_eq!(outcome.records[0].token(), "2885");
    }

    #[test]
    fn malformed_elements_skipped_others_kept() {
        let outcome = parse(r#"[Res]: [{"ltp":"1"}, 42, {"tk":"2885"}, {"tk":""}]"#).unwrap();

        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.malformed, 3);
        assert_eq!(outcome.elements(), 4);
    }

    #[test]
    fn element_order_preserved() {
        let outcome = parse(
            r#"[Res]: [{"tk":"11536","ltp":"1"},{"tk":"2885","ltp":"2"},{"tk":"11536","ltp":"3"}]"#,
        )
        .unwrap();

        let prices: Vec<_> = outcome.records.iter().map(|r| r.last_price).collect();
        assert_eq!(prices, vec![Some(dec!(1)), Some(dec!(2)), Some(dec!(3))]);
    }

    #[test]
    fn exchange_disambiguates_token() {
        let ambiguous = parse(r#"[Res]: [{"tk":"500325","ltp":"1"}]"#).unwrap();
        assert_eq!(ambiguous.unsubscribed, 1);

        let explicit = parse(r#"[Res]: [{"tk":"500325","e":"BSE_CM","ltp":"1"}]"#).unwrap();
        assert_eq!(explicit.records[0].exchange(), &ExchangeSegment::BseCm);

        let wrong = parse(r#"[Res]: [{"tk":"2885","e":"bse_cm","ltp":"1"}]"#).unwrap();
        assert_eq!(wrong.unsubscribed, 1);
    }

    #[test]
    fn single_element_object() {
        let outcome = parse(r#"[Res]: {"tk":"2885","e":"nse_cm","ltp":"1"}"#).unwrap();
        assert_eq!(outcome.records.len(), 1);
    }

    #[test]
    fn control_frame_ignored() {
        let outcome = parse(r#"[Res]: {"type":"cn","ak":"ok","msg":"connected"}"#).unwrap();
        assert!(outcome.ignored);
        assert!(outcome.records.is_empty());
    }

    #[test]
    fn empty_array_yields_nothing() {
        let outcome = parse("[Res]: []").unwrap();
        assert_eq!(outcome.elements(), 0);
        assert!(!outcome.ignored);
    }

    #[test_case("{\"tk\":\"2885\"}", "missing_prefix" ; "no prefix")]
    #[test_case("[Res]: {not json", "invalid_json" ; "broken json")]
    #[test_case("[Res]:", "invalid_json" ; "empty body")]
    #[test_case("[Res]: \"hello\"", "unexpected_body" ; "string body")]
    #[test_case("[Res]: {\"data\":5}", "unexpected_body" ; "scalar data")]
    fn envelope_errors(payload: &str, kind: &str) {
        let err = parse(payload).unwrap_err();
        assert_eq!(err.kind(), kind);
    }

    #[test]
    fn record_carries_receive_time() {
        let received_at = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let outcome = parser()
            .parse(&RawMessage::at(r#"[Res]: [{"tk":"2885"}]"#, received_at))
            .unwrap();
        assert_eq!(outcome.records[0].received_at, received_at);
    }
}
