#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::default_trait_access,
        clippy::items_after_statements
    )
)]

//! Feed Ingestor - Streaming Market Data Ingestion
//!
//! Receives push-feed market data payloads, parses them into per-instrument
//! records, buffers the records, and flushes them in batches to a persistent
//! store while keeping cumulative ingestion statistics.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Core types with no I/O
//!   - `streaming`: Raw payloads and parsed feed records
//!   - `subscription`: Instrument identity and the subscription set
//!   - `stats`: Flush outcomes and cumulative statistics
//!
//! - **Application**: The engine and its ports
//!   - `ports`: Feed source, feed store, instrument directory
//!   - `services`: Bridge queue, parser, flush scheduler, stats tracker
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `feed`: WebSocket and replay feed sources
//!   - `store`: PostgreSQL and in-memory stores
//!   - `registry`: JSON instrument registry
//!   - `config`: Environment configuration
//!   - `health`: Health check HTTP endpoint
//!
//! # Data Flow
//!
//! ```text
//! Feed source ──► Bridge queue ──► Parser ──► Buffer ──► Flush ──► Store
//! (any thread)    (bounded)        (scheduler task)      (one in flight)
//!                                                           │
//!                                                           ▼
//!                                                    Stats tracker
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core types with no external dependencies.
pub mod domain;

/// Application layer - Engine services and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::stats::{FlushOutcome, IngestionStats};
pub use domain::streaming::{FeedRecord, RawMessage};
pub use domain::subscription::{
    ExchangeSegment, InstrumentKey, SubscribedInstrument, SubscriptionChanges, SubscriptionSet,
};

// Ports
pub use application::ports::{
    FeedSink, FeedSource, FeedSourceError, FeedStore, InstrumentDirectory, StoreError,
};

// Engine
pub use application::services::{
    BridgeQueue, EngineConfig, EngineHandle, EngineMonitor, EngineReport, EngineStatus,
    FlushState, IngestionEngine, MessageParser, OverflowPolicy, ParseOutcome, PipelineSnapshot,
    StatsTracker,
};

// Infrastructure config
pub use infrastructure::config::{
    ConfigError, FeedKind, FeedSettings, IngestorConfig, ServerSettings, StoreKind, StoreSettings,
};

// Adapters
pub use infrastructure::feed::{FeedHealth, ReplayFeed, WebSocketFeed, WebSocketFeedConfig};
pub use infrastructure::registry::{InstrumentRecord, InstrumentRegistry, RegistryError};
pub use infrastructure::store::{InMemoryFeedStore, PostgresFeedStore};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
