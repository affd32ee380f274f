//! Feed Ingestor Binary
//!
//! Starts the ingestion engine, connects the configured feed source, and
//! runs until SIGINT/SIGTERM (or until a replay file is exhausted).
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin feed-ingestor
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `DATABASE_URL`: PostgreSQL connection string (when `INGEST_STORE=postgres`)
//! - `FEED_WS_URL`: push feed URL (when `FEED_SOURCE=websocket`)
//! - `FEED_REPLAY_PATH`: payload file (when `FEED_SOURCE=replay`)
//!
//! ## Optional
//! - `INGEST_FLUSH_INTERVAL_SECS`: flush timer period (default: 3)
//! - `INGEST_BUFFER_THRESHOLD`: size-triggered flush (default: 1000)
//! - `INGEST_QUEUE_CAPACITY`: bridge queue capacity (default: 10000)
//! - `INGEST_WRITE_TIMEOUT_SECS`: deadline per store call (default: 30)
//! - `INGEST_MAX_BUFFERED_RECORDS`: intake pause point during a write (default: 10000)
//! - `INGEST_OVERFLOW_POLICY`: drop-newest | drop-oldest (default: drop-newest)
//! - `INGEST_STORE`: postgres | memory (default: postgres)
//! - `FEED_SOURCE`: websocket | replay (default: websocket)
//! - `INSTRUMENTS_PATH`: JSON instrument registry
//! - `INGEST_INSTRUMENTS`: `token:exchange,...` subscription override
//! - `INGEST_HEALTH_PORT`: health/metrics HTTP port, 0 disables (default: 8083)
//! - `OTEL_ENABLED`: export spans over OTLP (default: false)
//! - `RUST_LOG`: log filter (default: info)

use std::sync::Arc;

use anyhow::Context;
use feed_ingestor::application::services::backoff::BackoffConfig;
use feed_ingestor::infrastructure::config::{FeedKind, IngestorConfig, StoreKind};
use feed_ingestor::infrastructure::health::{HealthServer, HealthServerState};
use feed_ingestor::infrastructure::telemetry;
use feed_ingestor::{
    FeedHealth, FeedSource, FeedStore, InMemoryFeedStore, IngestionEngine, InstrumentDirectory,
    InstrumentRegistry, PostgresFeedStore, ReplayFeed, SubscribedInstrument, SubscriptionSet,
    WebSocketFeed, WebSocketFeedConfig, init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// A constructed feed source with its health handle and, for replays, the
/// completion token.
struct Feed {
    source: Arc<dyn FeedSource>,
    health: Arc<FeedHealth>,
    finished: Option<CancellationToken>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        eprintln!("rustls crypto provider was already installed");
    }

    load_dotenv();

    let _telemetry_guard = telemetry::init().context("failed to initialize telemetry")?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting feed ingestor");

    if let Err(e) = init_metrics() {
        tracing::warn!(error = %e, "Prometheus recorder unavailable, metrics disabled");
    }

    let config = IngestorConfig::from_env().context("invalid configuration")?;
    log_config(&config);

    let subscriptions = Arc::new(build_subscriptions(&config)?);
    if subscriptions.is_empty() {
        tracing::warn!("No instruments configured, every feed record will be dropped");
    }

    let store = build_store(&config).await?;
    let directory: Arc<dyn InstrumentDirectory> = subscriptions.clone();
    let engine = IngestionEngine::start(config.engine.clone(), store, directory).await;

    let feed = build_feed(&config)?;
    feed.source
        .subscribe(&subscriptions.keys(), engine.sink())
        .await
        .with_context(|| format!("failed to subscribe {} feed", feed.source.name()))?;

    let shutdown_token = CancellationToken::new();
    if config.server.health_port != 0 {
        let health_state = Arc::new(HealthServerState::new(
            env!("CARGO_PKG_VERSION").to_string(),
            engine.monitor(),
            Arc::clone(&feed.health),
        ));
        let health_server = HealthServer::new(
            config.server.health_port,
            health_state,
            shutdown_token.clone(),
        );
        tokio::spawn(async move {
            if let Err(e) = health_server.run().await {
                tracing::error!(error = %e, "Health server error");
            }
        });
    }

    tracing::info!(
        feed = feed.source.name(),
        instruments = subscriptions.len(),
        "Feed ingestor ready"
    );

    await_shutdown(feed.finished.as_ref()).await;

    if let Err(e) = feed.source.unsubscribe().await {
        tracing::warn!(error = %e, "Failed to unsubscribe feed");
    }

    match engine.shutdown().await {
        Ok(report) => tracing::info!(
            records_processed = report.stats.records_processed,
            records_lost = report.stats.records_lost,
            final_batch = report.final_batch_size,
            parse_errors = report.pipeline.parse_errors,
            overflow_dropped = report.pipeline.overflow_dropped,
            "Engine drained"
        ),
        Err(e) => tracing::error!(error = %e, "Engine task failed during shutdown"),
    }

    shutdown_token.cancel();
    tracing::info!("Feed ingestor stopped");
    Ok(())
}

/// Subscription set from the registry, narrowed by explicit overrides.
fn build_subscriptions(config: &IngestorConfig) -> anyhow::Result<SubscriptionSet> {
    let registry = match &config.instruments.registry_path {
        Some(path) => InstrumentRegistry::load(path)?,
        None => InstrumentRegistry::default(),
    };

    if config.instruments.overrides.is_empty() {
        return Ok(SubscriptionSet::from_instruments(
            registry.subscribed_instruments(),
        ));
    }

    let instruments = config.instruments.overrides.iter().map(|key| {
        let member = SubscribedInstrument::new(key.clone());
        match registry
            .get_by_token(&key.token)
            .find(|entry| entry.exchange_segment == key.exchange)
        {
            Some(entry) => member.with_symbol(&entry.symbol),
            None => member,
        }
    });
    Ok(SubscriptionSet::from_instruments(instruments))
}

async fn build_store(config: &IngestorConfig) -> anyhow::Result<Arc<dyn FeedStore>> {
    match config.store.kind {
        StoreKind::Postgres => {
            let url = config
                .store
                .database_url
                .as_ref()
                .context("DATABASE_URL is required for the postgres store")?;
            let store = PostgresFeedStore::connect(url.expose(), config.store.max_connections)
                .await
                .context("failed to connect to the feed store")?;
            store
                .run_migrations()
                .await
                .context("failed to migrate the feed store")?;
            Ok(Arc::new(store))
        }
        StoreKind::Memory => {
            tracing::warn!("Using in-memory store, ingested data is discarded on exit");
            Ok(Arc::new(InMemoryFeedStore::new()))
        }
    }
}

fn build_feed(config: &IngestorConfig) -> anyhow::Result<Feed> {
    match config.feed.kind {
        FeedKind::WebSocket => {
            let url = config
                .feed
                .ws_url
                .clone()
                .context("FEED_WS_URL is required for the websocket feed")?;
            let reconnect = BackoffConfig {
                initial_delay: config.feed.reconnect_delay_initial,
                max_delay: config.feed.reconnect_delay_max,
                ..BackoffConfig::for_reconnect()
            };
            let feed = WebSocketFeed::new(WebSocketFeedConfig::new(url).with_reconnect(reconnect));
            Ok(Feed {
                health: feed.health(),
                source: Arc::new(feed),
                finished: None,
            })
        }
        FeedKind::Replay => {
            let path = config
                .feed
                .replay_path
                .clone()
                .context("FEED_REPLAY_PATH is required for the replay feed")?;
            let feed = ReplayFeed::new(path, config.feed.replay_interval);
            Ok(Feed {
                health: feed.health(),
                finished: Some(feed.finished()),
                source: Arc::new(feed),
            })
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &IngestorConfig) {
    tracing::info!(
        store = config.store.kind.as_str(),
        feed = config.feed.kind.as_str(),
        flush_interval_secs = config.engine.flush_interval.as_secs(),
        buffer_threshold = config.engine.buffer_threshold,
        queue_capacity = config.engine.queue_capacity,
        overflow_policy = config.engine.overflow_policy.as_str(),
        max_flush_attempts = config.engine.max_flush_attempts,
        write_timeout_secs = config.engine.write_timeout.as_secs(),
        max_buffered_records = config.engine.max_buffered_records,
        health_port = config.server.health_port,
        "Configuration loaded"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for SIGINT, SIGTERM, or the end of a replay.
async fn await_shutdown(replay_finished: Option<&CancellationToken>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let replay_done = async {
        match replay_finished {
            Some(token) => token.cancelled().await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
        () = replay_done => {
            tracing::info!("Replay finished, initiating shutdown");
        }
    }
}
