//! Health Check and Metrics Endpoint
//!
//! Read-only HTTP surface for orchestrators and monitoring. Nothing here can
//! change the engine's state.
//!
//! # Endpoints
//!
//! - `GET /health` - JSON health status
//! - `GET /healthz` - liveness probe (simple OK)
//! - `GET /readyz` - readiness probe (engine accepting and feed connected)
//! - `GET /stats` - ingestion statistics and pipeline counters
//! - `GET /metrics` - Prometheus metrics in text format

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::{EngineMonitor, EngineStatus, FlushState};
use crate::infrastructure::feed::{FeedHealth, FeedHealthSnapshot};
use crate::infrastructure::metrics::get_metrics_handle;

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status.
    pub status: HealthStatus,
    /// Ingestor version.
    pub version: String,
    /// Uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Flush scheduler state.
    pub engine_state: FlushState,
    /// Feed source state.
    pub feed: FeedHealthSnapshot,
    /// Records committed, all time.
    pub records_processed: u64,
    /// Time of the last successful flush.
    pub last_flush_at: Option<DateTime<Utc>>,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Engine accepting and feed connected.
    Healthy,
    /// Engine accepting but the feed is down.
    Degraded,
    /// Engine draining or stopped.
    Unhealthy,
}

/// Body of `GET /stats`.
#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    /// Engine status.
    #[serde(flatten)]
    pub engine: EngineStatus,
    /// Feed source state.
    pub feed: FeedHealthSnapshot,
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    monitor: EngineMonitor,
    feed: Arc<FeedHealth>,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(version: String, monitor: EngineMonitor, feed: Arc<FeedHealth>) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            monitor,
            feed,
        }
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");
        self.serve(listener).await
    }

    /// Serve on an already bound listener until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError::ServerFailed` on a fatal server error.
    pub async fn serve(self, listener: TcpListener) -> Result<(), HealthServerError> {
        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

fn router(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let status = determine_health_status(state.monitor.is_accepting(), state.feed.is_connected());

    if status == HealthStatus::Healthy {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn stats_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    Json(StatsResponse {
        engine: state.monitor.status(),
        feed: state.feed.snapshot(),
    })
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                handle.render(),
            )
        },
    )
}

fn build_health_response(state: &HealthServerState) -> HealthResponse {
    let feed = state.feed.snapshot();
    let stats = state.monitor.stats();
    let status = determine_health_status(state.monitor.is_accepting(), feed.connected);

    HealthResponse {
        status,
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        engine_state: state.monitor.state(),
        feed,
        records_processed: stats.records_processed,
        last_flush_at: stats.last_flush_at,
    }
}

const fn determine_health_status(engine_accepting: bool, feed_connected: bool) -> HealthStatus {
    match (engine_accepting, feed_connected) {
        (true, true) => HealthStatus::Healthy,
        (true, false) => HealthStatus::Degraded,
        (false, _) => HealthStatus::Unhealthy,
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use axum::response::Response;

    use super::*;
    use crate::application::services::{EngineConfig, IngestionEngine};
    use crate::domain::subscription::SubscriptionSet;
    use crate::infrastructure::store::InMemoryFeedStore;

    #[test]
    fn health_status_serialization() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Healthy).unwrap(),
            "\"healthy\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Degraded).unwrap(),
            "\"degraded\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Unhealthy).unwrap(),
            "\"unhealthy\""
        );
    }

    #[test]
    fn status_follows_engine_then_feed() {
        assert_eq!(determine_health_status(true, true), HealthStatus::Healthy);
        assert_eq!(determine_health_status(true, false), HealthStatus::Degraded);
        assert_eq!(determine_health_status(false, true), HealthStatus::Unhealthy);
    }

    async fn into_parts(response: impl IntoResponse) -> (StatusCode, String) {
        let response: Response = response.into_response();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn readiness_tracks_feed_and_engine() {
        let engine = IngestionEngine::start(
            EngineConfig::default(),
            Arc::new(InMemoryFeedStore::new()),
            Arc::new(SubscriptionSet::new()),
        )
        .await;
        let feed = Arc::new(FeedHealth::new("test"));
        let state = Arc::new(HealthServerState::new(
            "0.1.0".to_string(),
            engine.monitor(),
            Arc::clone(&feed),
        ));

        let (status, _) = into_parts(readiness_handler(State(Arc::clone(&state))).await).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        feed.set_connected(true);
        let (status, body) = into_parts(readiness_handler(State(Arc::clone(&state))).await).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "READY");

        let (status, body) = into_parts(health_handler(State(Arc::clone(&state))).await).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("\"status\":\"healthy\""));

        let (_, body) = into_parts(stats_handler(State(Arc::clone(&state))).await).await;
        assert!(body.contains("\"records_processed\":0"));
        assert!(body.contains("\"pipeline\""));

        engine.shutdown().await.unwrap();
        let (status, body) = into_parts(health_handler(State(state)).await).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body.contains("\"status\":\"unhealthy\""));
    }

    #[tokio::test]
    async fn serves_over_http_until_cancelled() {
        let engine = IngestionEngine::start(
            EngineConfig::default(),
            Arc::new(InMemoryFeedStore::new()),
            Arc::new(SubscriptionSet::new()),
        )
        .await;
        let state = Arc::new(HealthServerState::new(
            "0.1.0".to_string(),
            engine.monitor(),
            Arc::new(FeedHealth::new("test")),
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let cancel = CancellationToken::new();
        let server = tokio::spawn(HealthServer::new(0, state, cancel.clone()).serve(listener));

        cancel.cancel();
        server.await.unwrap().unwrap();
        engine.shutdown().await.unwrap();
    }
}
