//! Application Ports
//!
//! Interfaces between the ingestion core and the systems around it.
//!
//! ## Driven Ports (Outbound)
//!
//! - `FeedStore`: batched persistence of records and the statistics row
//! - `InstrumentDirectory`: read-only lookup of subscribed instruments
//!
//! ## Driver Ports (Inbound)
//!
//! - `FeedSource`: a push feed that delivers raw payloads into a `FeedSink`

mod feed_source_port;
mod feed_store_port;
mod instrument_directory_port;

pub use feed_source_port::{FeedSink, FeedSource, FeedSourceError};
pub use feed_store_port::{FeedStore, StoreError};
pub use instrument_directory_port::InstrumentDirectory;
