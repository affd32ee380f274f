//! Instrument Registry
//!
//! Loads the JSON instrument file that supplies the default subscription set
//! and symbol names:
//!
//! ```json
//! [
//!   {
//!     "instrument_token": "2885",
//!     "exchange_segment": "nse_cm",
//!     "symbol": "RELIANCE",
//!     "company_name": "Reliance Industries Ltd",
//!     "sector": "Energy",
//!     "instrument_type": "EQ"
//!   }
//! ]
//! ```
//!
//! Entries are keyed by symbol and exchange; a later duplicate replaces an
//! earlier one.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer};

use crate::domain::subscription::{ExchangeSegment, InstrumentKey, SubscribedInstrument};

/// Registry loading error.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The file could not be read.
    #[error("failed to read instrument registry {path}: {source}")]
    Io {
        /// Registry path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The file is not a valid instrument list.
    #[error("invalid instrument registry: {0}")]
    Json(#[from] serde_json::Error),
}

/// Tokens appear both as strings and as bare numbers in exported files.
fn token_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Token {
        Text(String),
        Number(u64),
    }

    Ok(match Token::deserialize(deserializer)? {
        Token::Text(s) => s.trim().to_string(),
        Token::Number(n) => n.to_string(),
    })
}

/// One registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InstrumentRecord {
    /// Feed instrument token.
    #[serde(deserialize_with = "token_string")]
    pub instrument_token: String,
    /// Exchange segment.
    pub exchange_segment: ExchangeSegment,
    /// Trading symbol.
    pub symbol: String,
    /// Company name.
    #[serde(default)]
    pub company_name: String,
    /// Sector, when classified.
    #[serde(default)]
    pub sector: Option<String>,
    /// Instrument type, e.g. `EQ`.
    #[serde(default)]
    pub instrument_type: String,
}

impl InstrumentRecord {
    /// Feed identity of the entry.
    #[must_use]
    pub fn key(&self) -> InstrumentKey {
        InstrumentKey::new(&self.instrument_token, self.exchange_segment.clone())
    }
}

/// Loaded instrument registry.
#[derive(Debug, Clone, Default)]
pub struct InstrumentRegistry {
    instruments: Vec<InstrumentRecord>,
}

impl InstrumentRegistry {
    /// Load a registry file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| RegistryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let registry = Self::from_json(&contents)?;
        tracing::info!(
            path = %path.display(),
            instruments = registry.len(),
            "Loaded instrument registry"
        );
        Ok(registry)
    }

    /// Parse a registry from JSON text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a JSON array of entries.
    pub fn from_json(json: &str) -> Result<Self, RegistryError> {
        let entries: Vec<InstrumentRecord> = serde_json::from_str(json)?;
        let mut instruments: Vec<InstrumentRecord> = Vec::with_capacity(entries.len());

        for entry in entries {
            match instruments
                .iter_mut()
                .find(|e| e.symbol == entry.symbol && e.exchange_segment == entry.exchange_segment)
            {
                Some(existing) => *existing = entry,
                None => instruments.push(entry),
            }
        }

        Ok(Self { instruments })
    }

    /// All entries, in file order.
    #[must_use]
    pub fn all(&self) -> &[InstrumentRecord] {
        &self.instruments
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instruments.len()
    }

    /// Check whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }

    /// Entries sharing a token, one per exchange.
    pub fn get_by_token<'a>(
        &'a self,
        token: &'a str,
    ) -> impl Iterator<Item = &'a InstrumentRecord> {
        self.instruments.iter().filter(move |e| e.instrument_token == token)
    }

    /// Entries as subscription members, carrying their symbols.
    #[must_use]
    pub fn subscribed_instruments(&self) -> Vec<SubscribedInstrument> {
        self.instruments
            .iter()
            .map(|e| SubscribedInstrument::new(e.key()).with_symbol(&e.symbol))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    const SAMPLE: &str = r#"[
        {"instrument_token": "2885", "exchange_segment": "nse_cm", "symbol": "RELIANCE",
         "company_name": "Reliance Industries Ltd", "sector": "Energy", "instrument_type": "EQ"},
        {"instrument_token": 500325, "exchange_segment": "BSE_CM", "symbol": "RELIANCE",
         "company_name": "Reliance Industries Ltd", "sector": "Energy", "instrument_type": "EQ"},
        {"instrument_token": "11536", "exchange_segment": "nse_cm", "symbol": "TCS",
         "company_name": "Tata Consultancy Services", "sector": "IT", "instrument_type": "EQ"}
    ]"#;

    #[test]
    fn parses_entries_with_numeric_tokens() {
        let registry = InstrumentRegistry::from_json(SAMPLE).unwrap();
        assert_eq!(registry.len(), 3);

        let bse: Vec<_> = registry.get_by_token("500325").collect();
        assert_eq!(bse.len(), 1);
        assert_eq!(bse[0].exchange_segment, ExchangeSegment::BseCm);
        assert_eq!(registry.get_by_token("2885").count(), 1);
    }

    #[test]
    fn later_duplicate_replaces_earlier() {
        let json = r#"[
            {"instrument_token": "1", "exchange_segment": "nse_cm", "symbol": "ABC"},
            {"instrument_token": "2", "exchange_segment": "nse_cm", "symbol": "ABC"}
        ]"#;
        let registry = InstrumentRegistry::from_json(json).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.all()[0].instrument_token, "2");
        assert!(registry.all()[0].sector.is_none());
    }

    #[test]
    fn subscription_members_carry_symbols() {
        let registry = InstrumentRegistry::from_json(SAMPLE).unwrap();
        let members = registry.subscribed_instruments();
        assert_eq!(members.len(), 3);
        assert_eq!(members[2].key, InstrumentKey::new("11536", ExchangeSegment::NseCm));
        assert_eq!(members[2].symbol.as_deref(), Some("TCS"));
    }

    #[test]
    fn load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let registry = InstrumentRegistry::load(file.path()).unwrap();
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn missing_file_reports_path() {
        let err = InstrumentRegistry::load("/nonexistent/instruments.json").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/instruments.json"));
    }

    #[test]
    fn rejects_non_array() {
        assert!(matches!(
            InstrumentRegistry::from_json(r#"{"symbol": "ABC"}"#),
            Err(RegistryError::Json(_))
        ));
    }
}
