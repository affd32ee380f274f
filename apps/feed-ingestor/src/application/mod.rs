//! Application Layer - Ingestion services and port definitions.
//!
//! This layer contains the ingestion pipeline and the port interfaces
//! that define how it interacts with feeds and storage.

/// Port interfaces for external systems (feed, store, instrument directory).
pub mod ports;

/// Ingestion pipeline: bridge queue, parser, flush scheduler, statistics.
pub mod services;
