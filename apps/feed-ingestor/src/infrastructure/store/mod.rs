//! Feed Store Adapters
//!
//! Implementations of the `FeedStore` port:
//!
//! - `postgres`: PostgreSQL/TimescaleDB via a `sqlx` connection pool
//! - `memory`: in-process store for tests and dry runs, with fault injection

pub mod memory;
pub mod postgres;

pub use memory::InMemoryFeedStore;
pub use postgres::PostgresFeedStore;
