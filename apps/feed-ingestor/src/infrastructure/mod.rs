//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// Configuration loaded from the environment.
pub mod config;

/// Feed source adapters (WebSocket push feed, file replay).
pub mod feed;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// JSON instrument registry.
pub mod registry;

/// Feed store adapters (PostgreSQL, in-memory).
pub mod store;

/// Logging and OpenTelemetry tracing integration.
pub mod telemetry;
