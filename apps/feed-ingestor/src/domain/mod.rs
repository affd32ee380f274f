//! Domain Layer - Core ingestion types and business rules.
//!
//! This layer contains the core domain types for market data ingestion
//! with no I/O. All types here are pure Rust with serialization support.

/// Market data types (raw payloads and parsed records).
pub mod streaming;

/// Instrument identity and subscription tracking.
pub mod subscription;

/// Cumulative ingestion statistics and flush outcomes.
pub mod stats;
