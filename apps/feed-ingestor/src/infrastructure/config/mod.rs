//! Configuration Module
//!
//! Configuration loading for the ingestor service.

mod settings;

pub use settings::{
    ConfigError, DatabaseUrl, FeedKind, FeedSettings, IngestorConfig, InstrumentSettings,
    ServerSettings, StoreKind, StoreSettings,
};
