//! Ingestor Configuration Settings
//!
//! Configuration types for the feed ingestor, loaded from environment
//! variables. Loading goes through a lookup function so tests can supply
//! values without touching the process environment.

use std::path::PathBuf;
use std::time::Duration;

use crate::application::services::{EngineConfig, OverflowPolicy};
use crate::domain::subscription::InstrumentKey;

/// Which store adapter persists batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreKind {
    /// PostgreSQL / TimescaleDB via `sqlx`.
    #[default]
    Postgres,
    /// In-process store; data is lost on exit.
    Memory,
}

impl StoreKind {
    /// Parse store kind from string.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "postgres" | "postgresql" | "timescale" => Some(Self::Postgres),
            "memory" | "in-memory" => Some(Self::Memory),
            _ => None,
        }
    }

    /// Get the store name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Memory => "memory",
        }
    }
}

/// Which feed source adapter delivers payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FeedKind {
    /// Push feed over WebSocket.
    #[default]
    WebSocket,
    /// Line-delimited payload file.
    Replay,
}

impl FeedKind {
    /// Parse feed kind from string.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "websocket" | "ws" => Some(Self::WebSocket),
            "replay" | "file" => Some(Self::Replay),
            _ => None,
        }
    }

    /// Get the feed name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::WebSocket => "websocket",
            Self::Replay => "replay",
        }
    }
}

/// Database connection string; redacted in debug output.
#[derive(Clone)]
pub struct DatabaseUrl(String);

impl DatabaseUrl {
    /// Wrap a connection string.
    #[must_use]
    pub const fn new(url: String) -> Self {
        Self(url)
    }

    /// Get the connection string.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for DatabaseUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DatabaseUrl([REDACTED])")
    }
}

/// Store settings.
#[derive(Debug, Clone)]
pub struct StoreSettings {
    /// Store adapter.
    pub kind: StoreKind,
    /// Connection string, required for Postgres.
    pub database_url: Option<DatabaseUrl>,
    /// Connection pool size.
    pub max_connections: u32,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            kind: StoreKind::Postgres,
            database_url: None,
            max_connections: 5,
        }
    }
}

/// Feed source settings.
#[derive(Debug, Clone)]
pub struct FeedSettings {
    /// Feed adapter.
    pub kind: FeedKind,
    /// Push feed URL, required for WebSocket.
    pub ws_url: Option<String>,
    /// Payload file, required for replay.
    pub replay_path: Option<PathBuf>,
    /// Pause between replayed lines.
    pub replay_interval: Duration,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            kind: FeedKind::WebSocket,
            ws_url: None,
            replay_path: None,
            replay_interval: Duration::ZERO,
            reconnect_delay_initial: Duration::from_secs(1),
            reconnect_delay_max: Duration::from_secs(60),
        }
    }
}

/// Where the subscription set comes from.
#[derive(Debug, Clone, Default)]
pub struct InstrumentSettings {
    /// JSON instrument registry.
    pub registry_path: Option<PathBuf>,
    /// Explicit instruments; take precedence over the registry's list.
    pub overrides: Vec<InstrumentKey>,
}

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Health and metrics HTTP port (0 = disabled).
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { health_port: 8083 }
    }
}

/// Complete ingestor configuration.
#[derive(Debug, Clone, Default)]
pub struct IngestorConfig {
    /// Engine tuning.
    pub engine: EngineConfig,
    /// Store settings.
    pub store: StoreSettings,
    /// Feed source settings.
    pub feed: FeedSettings,
    /// Subscription sources.
    pub instruments: InstrumentSettings,
    /// Server port settings.
    pub server: ServerSettings,
}

impl IngestorConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a required variable is missing, a value cannot be
    /// parsed, or a value that must be positive is zero.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// See [`IngestorConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let engine_defaults = EngineConfig::default();
        let feed_defaults = FeedSettings::default();

        let flush_interval_secs = match env.get("INGEST_FLUSH_INTERVAL_SECS") {
            Some(_) => env.positive_u64("INGEST_FLUSH_INTERVAL_SECS")?,
            None => env.positive_u64("BUFFER_FLUSH_INTERVAL")?,
        }
        .unwrap_or(engine_defaults.flush_interval.as_secs());

        let overflow_policy = match env.get("INGEST_OVERFLOW_POLICY") {
            Some(value) => OverflowPolicy::from_str_case_insensitive(&value)
                .ok_or_else(|| ConfigError::invalid("INGEST_OVERFLOW_POLICY", &value))?,
            None => engine_defaults.overflow_policy,
        };

        let engine = EngineConfig {
            flush_interval: Duration::from_secs(flush_interval_secs),
            buffer_threshold: env
                .positive_usize("INGEST_BUFFER_THRESHOLD")?
                .unwrap_or(engine_defaults.buffer_threshold),
            queue_capacity: env
                .positive_usize("INGEST_QUEUE_CAPACITY")?
                .unwrap_or(engine_defaults.queue_capacity),
            overflow_policy,
            max_flush_attempts: env
                .positive_u32("INGEST_MAX_FLUSH_ATTEMPTS")?
                .unwrap_or(engine_defaults.max_flush_attempts),
            flush_backoff_initial: env
                .positive_u64("INGEST_FLUSH_BACKOFF_INITIAL_MS")?
                .map_or(engine_defaults.flush_backoff_initial, Duration::from_millis),
            flush_backoff_max: env
                .positive_u64("INGEST_FLUSH_BACKOFF_MAX_MS")?
                .map_or(engine_defaults.flush_backoff_max, Duration::from_millis),
            flush_backoff_jitter: engine_defaults.flush_backoff_jitter,
            write_timeout: env
                .positive_u64("INGEST_WRITE_TIMEOUT_SECS")?
                .map_or(engine_defaults.write_timeout, Duration::from_secs),
            max_buffered_records: env
                .positive_usize("INGEST_MAX_BUFFERED_RECORDS")?
                .unwrap_or(engine_defaults.max_buffered_records),
        };

        let store_kind = match env.get("INGEST_STORE") {
            Some(value) => StoreKind::from_str_case_insensitive(&value)
                .ok_or_else(|| ConfigError::invalid("INGEST_STORE", &value))?,
            None => StoreKind::default(),
        };
        let database_url = env.get("DATABASE_URL").map(DatabaseUrl::new);
        if store_kind == StoreKind::Postgres && database_url.is_none() {
            return Err(ConfigError::MissingEnvVar("DATABASE_URL".to_string()));
        }
        let store = StoreSettings {
            kind: store_kind,
            database_url,
            max_connections: env
                .positive_u32("DATABASE_MAX_CONNECTIONS")?
                .unwrap_or(StoreSettings::default().max_connections),
        };

        let feed_kind = match env.get("FEED_SOURCE") {
            Some(value) => FeedKind::from_str_case_insensitive(&value)
                .ok_or_else(|| ConfigError::invalid("FEED_SOURCE", &value))?,
            None => FeedKind::default(),
        };
        let ws_url = env.get("FEED_WS_URL");
        let replay_path = env.get("FEED_REPLAY_PATH").map(PathBuf::from);
        match feed_kind {
            FeedKind::WebSocket if ws_url.is_none() => {
                return Err(ConfigError::MissingEnvVar("FEED_WS_URL".to_string()));
            }
            FeedKind::Replay if replay_path.is_none() => {
                return Err(ConfigError::MissingEnvVar("FEED_REPLAY_PATH".to_string()));
            }
            _ => {}
        }
        let feed = FeedSettings {
            kind: feed_kind,
            ws_url,
            replay_path,
            replay_interval: env
                .u64("FEED_REPLAY_INTERVAL_MS")?
                .map_or(feed_defaults.replay_interval, Duration::from_millis),
            reconnect_delay_initial: env
                .positive_u64("FEED_RECONNECT_DELAY_INITIAL_MS")?
                .map_or(feed_defaults.reconnect_delay_initial, Duration::from_millis),
            reconnect_delay_max: env
                .positive_u64("FEED_RECONNECT_DELAY_MAX_MS")?
                .map_or(feed_defaults.reconnect_delay_max, Duration::from_millis),
        };

        let overrides = match env.get("INGEST_INSTRUMENTS") {
            Some(value) => parse_instrument_list(&value)
                .ok_or_else(|| ConfigError::invalid("INGEST_INSTRUMENTS", &value))?,
            None => Vec::new(),
        };
        let instruments = InstrumentSettings {
            registry_path: env.get("INSTRUMENTS_PATH").map(PathBuf::from),
            overrides,
        };

        let server = ServerSettings {
            health_port: env
                .u16("INGEST_HEALTH_PORT")?
                .unwrap_or(ServerSettings::default().health_port),
        };

        Ok(Self {
            engine,
            store,
            feed,
            instruments,
            server,
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable cannot be parsed.
    #[error("environment variable {key} has invalid value {value:?}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Offending value.
        value: String,
    },
    /// Environment variable must be greater than zero.
    #[error("environment variable {0} must be greater than zero")]
    Zero(String),
}

impl ConfigError {
    fn invalid(key: &str, value: &str) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}

/// Parse `token:exchange[,token:exchange...]`, ignoring empty entries.
fn parse_instrument_list(value: &str) -> Option<Vec<InstrumentKey>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(InstrumentKey::parse)
        .collect()
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Non-empty, trimmed value.
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        self.get(key)
            .map(|value| value.parse().map_err(|_| ConfigError::invalid(key, &value)))
            .transpose()
    }

    fn u16(&self, key: &str) -> Result<Option<u16>, ConfigError> {
        self.parse(key)
    }

    fn u64(&self, key: &str) -> Result<Option<u64>, ConfigError> {
        self.parse(key)
    }

    fn positive_u64(&self, key: &str) -> Result<Option<u64>, ConfigError> {
        match self.parse::<u64>(key)? {
            Some(0) => Err(ConfigError::Zero(key.to_string())),
            other => Ok(other),
        }
    }

    fn positive_u32(&self, key: &str) -> Result<Option<u32>, ConfigError> {
        match self.parse::<u32>(key)? {
            Some(0) => Err(ConfigError::Zero(key.to_string())),
            other => Ok(other),
        }
    }

    fn positive_usize(&self, key: &str) -> Result<Option<usize>, ConfigError> {
        match self.parse::<usize>(key)? {
            Some(0) => Err(ConfigError::Zero(key.to_string())),
            other => Ok(other),
        }
    }
}
