//! Subscription Tracking Types
//!
//! Domain types identifying instruments and tracking which of them the
//! ingestor is currently subscribed to.
//!
//! # Design
//!
//! An instrument is identified by its feed token together with its exchange
//! segment. The [`SubscriptionSet`] indexes subscriptions by token so the
//! parser can match feed elements that omit the exchange field against the
//! subscribed exchanges for that token.
//!
//! The set is shared between whatever drives subscriptions and the message
//! parser, so late messages for instruments that were unsubscribed are
//! recognised and dropped.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// =============================================================================
// Exchange Segment
// =============================================================================

/// Exchange segment an instrument trades on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ExchangeSegment {
    /// NSE cash market.
    NseCm,
    /// BSE cash market.
    BseCm,
    /// NSE futures and options.
    NseFo,
    /// BSE futures and options.
    BseFo,
    /// NSE currency derivatives.
    CdeFo,
    /// MCX commodity derivatives.
    McxFo,
    /// Any segment not known above, kept verbatim (lowercased).
    Other(String),
}

impl ExchangeSegment {
    /// Parse a segment name, ignoring case.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "nse_cm" => Self::NseCm,
            "bse_cm" => Self::BseCm,
            "nse_fo" => Self::NseFo,
            "bse_fo" => Self::BseFo,
            "cde_fo" => Self::CdeFo,
            "mcx_fo" => Self::McxFo,
            other => Self::Other(other.to_string()),
        }
    }

    /// Wire name of the segment.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::NseCm => "nse_cm",
            Self::BseCm => "bse_cm",
            Self::NseFo => "nse_fo",
            Self::BseFo => "bse_fo",
            Self::CdeFo => "cde_fo",
            Self::McxFo => "mcx_fo",
            Self::Other(s) => s,
        }
    }
}

impl fmt::Display for ExchangeSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ExchangeSegment {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ExchangeSegment {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::from_str_case_insensitive(&s))
    }
}

// =============================================================================
// Instrument Key
// =============================================================================

/// Identity of an instrument on the feed: token plus exchange segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstrumentKey {
    /// Feed instrument token.
    pub token: String,
    /// Exchange segment.
    pub exchange: ExchangeSegment,
}

impl InstrumentKey {
    /// Create a new key.
    #[must_use]
    pub fn new(token: impl Into<String>, exchange: ExchangeSegment) -> Self {
        Self {
            token: token.into(),
            exchange,
        }
    }

    /// Parse a `token:exchange` pair, e.g. `2885:nse_cm`.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let (token, exchange) = s.trim().split_once(':')?;
        let token = token.trim();
        let exchange = exchange.trim();
        if token.is_empty() || exchange.is_empty() {
            return None;
        }
        Some(Self::new(token, ExchangeSegment::from_str_case_insensitive(exchange)))
    }
}

impl fmt::Display for InstrumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.token, self.exchange)
    }
}

/// A subscribed instrument with its trading symbol, when known.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscribedInstrument {
    /// Instrument identity.
    pub key: InstrumentKey,
    /// Trading symbol.
    pub symbol: Option<String>,
}

impl SubscribedInstrument {
    /// Create an instrument without a symbol.
    #[must_use]
    pub const fn new(key: InstrumentKey) -> Self {
        Self { key, symbol: None }
    }

    /// Attach a trading symbol.
    #[must_use]
    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }
}

// =============================================================================
// Subscription Changes
// =============================================================================

/// Changes to the subscription set that a feed source must apply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionChanges {
    /// Instruments to subscribe to.
    pub subscribe: HashSet<InstrumentKey>,
    /// Instruments to unsubscribe from.
    pub unsubscribe: HashSet<InstrumentKey>,
}

impl SubscriptionChanges {
    /// Check if there are any changes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribe.is_empty() && self.unsubscribe.is_empty()
    }
}

// =============================================================================
// Subscription Set
// =============================================================================

type TokenIndex = HashMap<String, BTreeMap<ExchangeSegment, Option<String>>>;

/// Thread-safe set of subscribed instruments, indexed by token.
///
/// # Example
///
/// ```rust
/// use feed_ingestor::domain::subscription::{
///     ExchangeSegment, InstrumentKey, SubscribedInstrument, SubscriptionSet,
/// };
///
/// let set = SubscriptionSet::new();
/// let key = InstrumentKey::new("2885", ExchangeSegment::NseCm);
///
/// let changes = set.subscribe([SubscribedInstrument::new(key.clone())]);
/// assert!(changes.subscribe.contains(&key));
/// assert!(set.contains(&key));
///
/// // A feed element without an exchange resolves through the token
/// assert_eq!(set.resolve("2885", None), Some(key));
/// ```
#[derive(Debug, Default)]
pub struct SubscriptionSet {
    by_token: RwLock<TokenIndex>,
}

impl SubscriptionSet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a set pre-populated with instruments.
    #[must_use]
    pub fn from_instruments(instruments: impl IntoIterator<Item = SubscribedInstrument>) -> Self {
        let set = Self::new();
        set.subscribe(instruments);
        set
    }

    /// Add instruments.
    ///
    /// Returns the instruments that were not already subscribed. A symbol
    /// supplied for an already-subscribed instrument replaces the old one.
    pub fn subscribe(
        &self,
        instruments: impl IntoIterator<Item = SubscribedInstrument>,
    ) -> SubscriptionChanges {
        let mut index = self.by_token.write();
        let mut changes = SubscriptionChanges::default();

        for instrument in instruments {
            let exchanges = index.entry(instrument.key.token.clone()).or_default();
            match exchanges.get_mut(&instrument.key.exchange) {
                Some(symbol) => {
                    if instrument.symbol.is_some() {
                        *symbol = instrument.symbol;
                    }
                }
                None => {
                    exchanges.insert(instrument.key.exchange.clone(), instrument.symbol);
                    changes.subscribe.insert(instrument.key);
                }
            }
        }

        changes
    }

    /// Remove instruments.
    ///
    /// Returns the instruments that were actually subscribed.
    pub fn unsubscribe<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a InstrumentKey>,
    ) -> SubscriptionChanges {
        let mut index = self.by_token.write();
        let mut changes = SubscriptionChanges::default();

        for key in keys {
            let Some(exchanges) = index.get_mut(&key.token) else {
                continue;
            };
            if exchanges.remove(&key.exchange).is_some() {
                changes.unsubscribe.insert(key.clone());
            }
            if exchanges.is_empty() {
                index.remove(&key.token);
            }
        }

        changes
    }

    /// Replace the whole set, returning the difference.
    pub fn replace(
        &self,
        instruments: impl IntoIterator<Item = SubscribedInstrument>,
    ) -> SubscriptionChanges {
        let incoming: Vec<SubscribedInstrument> = instruments.into_iter().collect();
        let wanted: HashSet<&InstrumentKey> = incoming.iter().map(|i| &i.key).collect();

        let stale: Vec<InstrumentKey> = self
            .keys()
            .into_iter()
            .filter(|k| !wanted.contains(k))
            .collect();

        let removed = self.unsubscribe(&stale);
        let added = self.subscribe(incoming);

        SubscriptionChanges {
            subscribe: added.subscribe,
            unsubscribe: removed.unsubscribe,
        }
    }

    /// Remove everything, returning what was subscribed.
    pub fn clear(&self) -> SubscriptionChanges {
        let mut index = self.by_token.write();
        let unsubscribe = index
            .drain()
            .flat_map(|(token, exchanges)| {
                exchanges
                    .into_keys()
                    .map(move |exchange| InstrumentKey::new(token.clone(), exchange))
            })
            .collect();

        SubscriptionChanges {
            subscribe: HashSet::new(),
            unsubscribe,
        }
    }

    /// Check whether an instrument is subscribed.
    #[must_use]
    pub fn contains(&self, key: &InstrumentKey) -> bool {
        self.by_token
            .read()
            .get(&key.token)
            .is_some_and(|exchanges| exchanges.contains_key(&key.exchange))
    }

    /// Resolve a feed element's identity to a subscribed instrument.
    ///
    /// With an exchange, the pair must be subscribed. Without one, the token
    /// must be subscribed on exactly one exchange.
    #[must_use]
    pub fn resolve(&self, token: &str, exchange: Option<&ExchangeSegment>) -> Option<InstrumentKey> {
        let index = self.by_token.read();
        let exchanges = index.get(token)?;

        match exchange {
            Some(exchange) => exchanges
                .contains_key(exchange)
                .then(|| InstrumentKey::new(token, exchange.clone())),
            None if exchanges.len() == 1 => exchanges
                .keys()
                .next()
                .map(|exchange| InstrumentKey::new(token, exchange.clone())),
            None => None,
        }
    }

    /// Trading symbol registered for an instrument.
    #[must_use]
    pub fn symbol_for(&self, key: &InstrumentKey) -> Option<String> {
        self.by_token
            .read()
            .get(&key.token)
            .and_then(|exchanges| exchanges.get(&key.exchange))
            .cloned()
            .flatten()
    }

    /// All subscribed instrument keys, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<InstrumentKey> {
        let mut keys: Vec<InstrumentKey> = self
            .by_token
            .read()
            .iter()
            .flat_map(|(token, exchanges)| {
                exchanges
                    .keys()
                    .map(move |exchange| InstrumentKey::new(token.clone(), exchange.clone()))
            })
            .collect();
        keys.sort();
        keys
    }

    /// All subscribed instruments with their symbols, sorted by key.
    #[must_use]
    pub fn instruments(&self) -> Vec<SubscribedInstrument> {
        let mut instruments: Vec<SubscribedInstrument> = self
            .by_token
            .read()
            .iter()
            .flat_map(|(token, exchanges)| {
                exchanges.iter().map(move |(exchange, symbol)| SubscribedInstrument {
                    key: InstrumentKey::new(token.clone(), exchange.clone()),
                    symbol: symbol.clone(),
                })
            })
            .collect();
        instruments.sort_by(|a, b| a.key.cmp(&b.key));
        instruments
    }

    /// Number of subscribed instruments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_token.read().values().map(BTreeMap::len).sum()
    }

    /// Check whether nothing is subscribed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_token.read().is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn nse(token: &str) -> InstrumentKey {
        InstrumentKey::new(token, ExchangeSegment::NseCm)
    }

    fn bse(token: &str) -> InstrumentKey {
        InstrumentKey::new(token, ExchangeSegment::BseCm)
    }

    #[test]
    fn exchange_segment_parsing() {
        assert_eq!(
            ExchangeSegment::from_str_case_insensitive("NSE_CM"),
            ExchangeSegment::NseCm
        );
        assert_eq!(
            ExchangeSegment::from_str_case_insensitive("mcx_fo"),
            ExchangeSegment::McxFo
        );
        assert_eq!(
            ExchangeSegment::from_str_case_insensitive("NSE_COM"),
            ExchangeSegment::Other("nse_com".to_string())
        );
        assert_eq!(ExchangeSegment::Other("x_y".to_string()).as_str(), "x_y");
    }

    #[test]
    fn exchange_segment_serde_round_trips_as_string() {
        let json = serde_json::to_string(&ExchangeSegment::BseFo).unwrap();
        assert_eq!(json, "\"bse_fo\"");
        let back: ExchangeSegment = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ExchangeSegment::BseFo);
    }

    #[test]
    fn instrument_key_parse() {
        assert_eq!(InstrumentKey::parse("2885:nse_cm"), Some(nse("2885")));
        assert_eq!(InstrumentKey::parse(" 500325 : BSE_CM "), Some(bse("500325")));
        assert_eq!(InstrumentKey::parse("2885"), None);
        assert_eq!(InstrumentKey::parse(":nse_cm"), None);
        assert_eq!(nse("2885").to_string(), "2885:nse_cm");
    }

    #[test]
    fn subscribe_reports_only_new_instruments() {
        let set = SubscriptionSet::new();

        let first = set.subscribe([SubscribedInstrument::new(nse("2885"))]);
        assert!(first.subscribe.contains(&nse("2885")));

        let second = set.subscribe([
            SubscribedInstrument::new(nse("2885")),
            SubscribedInstrument::new(nse("11536")),
        ]);
        assert_eq!(second.subscribe.len(), 1);
        assert!(second.subscribe.contains(&nse("11536")));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn unsubscribe_removes_and_reports() {
        let set = SubscriptionSet::from_instruments([
            SubscribedInstrument::new(nse("2885")),
            SubscribedInstrument::new(bse("2885")),
        ]);

        let changes = set.unsubscribe(&[nse("2885"), nse("99999")]);

        assert_eq!(changes.unsubscribe.len(), 1);
        assert!(!set.contains(&nse("2885")));
        assert!(set.contains(&bse("2885")));
    }

    #[test]
    fn resolve_without_exchange_requires_unique_token() {
        let set = SubscriptionSet::from_instruments([
            SubscribedInstrument::new(nse("2885")),
            SubscribedInstrument::new(nse("11536")),
            SubscribedInstrument::new(bse("11536")),
        ]);

        assert_eq!(set.resolve("2885", None), Some(nse("2885")));
        assert_eq!(set.resolve("11536", None), None);
        assert_eq!(
            set.resolve("11536", Some(&ExchangeSegment::BseCm)),
            Some(bse("11536"))
        );
        assert_eq!(set.resolve("2885", Some(&ExchangeSegment::BseCm)), None);
        assert_eq!(set.resolve("99999", None), None);
    }

    #[test]
    fn symbols_are_tracked_and_updated() {
        let set = SubscriptionSet::from_instruments([SubscribedInstrument::new(nse("2885"))]);
        assert_eq!(set.symbol_for(&nse("2885")), None);

        set.subscribe([SubscribedInstrument::new(nse("2885")).with_symbol("RELIANCE")]);
        assert_eq!(set.symbol_for(&nse("2885")), Some("RELIANCE".to_string()));

        // Re-subscribing without a symbol keeps the known one
        set.subscribe([SubscribedInstrument::new(nse("2885"))]);
        assert_eq!(set.symbol_for(&nse("2885")), Some("RELIANCE".to_string()));
    }

    #[test]
    fn replace_returns_difference() {
        let set = SubscriptionSet::from_instruments([
            SubscribedInstrument::new(nse("1")),
            SubscribedInstrument::new(nse("2")),
        ]);

        let changes = set.replace([
            SubscribedInstrument::new(nse("2")),
            SubscribedInstrument::new(nse("3")),
        ]);

        assert_eq!(changes.subscribe, HashSet::from([nse("3")]));
        assert_eq!(changes.unsubscribe, HashSet::from([nse("1")]));
        assert_eq!(set.keys(), vec![nse("2"), nse("3")]);
    }

    #[test]
    fn clear_empties_set() {
        let set = SubscriptionSet::from_instruments([
            SubscribedInstrument::new(nse("1")),
            SubscribedInstrument::new(bse("1")),
        ]);

        let changes = set.clear();

        assert_eq!(changes.unsubscribe.len(), 2);
        assert!(set.is_empty());
        assert_eq!(set.len(), 0);
    }
}
