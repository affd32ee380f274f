//! Application Services
//!
//! The ingestion pipeline, leaf first:
//!
//! - `bridge`: bounded hand-off from the feed's delivery context
//! - `parser`: payload envelope and element decoding
//! - `tracker`: published ingestion statistics
//! - `scheduler`: buffer ownership, timed and threshold flushes, retries
//! - `engine`: wiring, handles and shutdown

pub mod backoff;
pub mod bridge;
pub mod engine;
pub mod parser;
pub mod scheduler;
pub mod throttle;
pub mod tracker;

pub use bridge::{BridgeQueue, BridgeStats, EnqueueResult, OverflowPolicy};
pub use engine::{
    EngineConfig, EngineHandle, EngineJoinError, EngineMonitor, EngineReport, EngineStatus,
    IngestionEngine, PipelineSnapshot,
};
pub use parser::{EnvelopeError, MessageParser, ParseOutcome};
pub use scheduler::FlushState;
pub use tracker::StatsTracker;
