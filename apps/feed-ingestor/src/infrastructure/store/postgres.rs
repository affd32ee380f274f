//! PostgreSQL Feed Store
//!
//! Writes record batches to `stock_feeds` and keeps the cumulative
//! statistics in the single-row `ingestion_stats` table.
//!
//! # Schema
//!
//! Created by [`PostgresFeedStore::run_migrations`]. Prices are `NUMERIC` so
//! decimals round-trip exactly; the original feed element is kept in
//! `raw_data` as `JSONB`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder, Row};

use crate::application::ports::{FeedStore, StoreError};
use crate::domain::stats::IngestionStats;
use crate::domain::streaming::FeedRecord;

/// Records per `INSERT` statement. 18 binds each keeps a statement well under
/// the 65535 parameter limit.
const INSERT_CHUNK: usize = 1_000;

/// Primary key of the only statistics row.
const STATS_ROW_ID: i32 = 1;

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Self::unavailable(e.to_string()),
            other => Self::query(other.to_string()),
        }
    }
}

fn to_db_count(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_db_count(column: &str, value: Option<i64>) -> Result<u64, StoreError> {
    let value = value.unwrap_or(0);
    u64::try_from(value).map_err(|_| StoreError::InvalidData {
        message: format!("{column} is negative: {value}"),
    })
}

/// `FeedStore` backed by PostgreSQL.
#[derive(Debug, Clone)]
pub struct PostgresFeedStore {
    pool: PgPool,
}

impl PostgresFeedStore {
    /// Wrap an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool against `url`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Unavailable` if no connection can be established.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(url)
            .await
            .map_err(|e| StoreError::unavailable(e.to_string()))?;

        Ok(Self::new(pool))
    }

    /// Pool reference.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes if missing.
    ///
    /// # Errors
    ///
    /// Returns an error if any DDL statement fails.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        tracing::info!("Running feed store migrations");

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS stock_feeds (
                id BIGSERIAL PRIMARY KEY,
                timestamp TIMESTAMPTZ NOT NULL,
                symbol VARCHAR(50),
                token VARCHAR(20) NOT NULL,
                exchange VARCHAR(20) NOT NULL,
                ltp NUMERIC,
                ltq BIGINT,
                volume BIGINT,
                turnover NUMERIC,
                change_amount NUMERIC,
                change_percent NUMERIC,
                bid_price NUMERIC,
                ask_price NUMERIC,
                bid_qty BIGINT,
                ask_qty BIGINT,
                total_buy_qty BIGINT,
                total_sell_qty BIGINT,
                last_trade_time TIMESTAMPTZ,
                feed_time TIMESTAMPTZ,
                raw_data JSONB,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE INDEX IF NOT EXISTS idx_stock_feeds_token_ts
            ON stock_feeds (token, exchange, timestamp DESC)
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS ingestion_stats (
                id INTEGER PRIMARY KEY,
                records_processed BIGINT NOT NULL DEFAULT 0,
                last_processed_at TIMESTAMPTZ,
                batch_size BIGINT,
                processing_time_ms BIGINT,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        tracing::info!("Feed store migrations completed");
        Ok(())
    }
}

#[async_trait]
impl FeedStore for PostgresFeedStore {
    async fn write_batch(&self, records: &[FeedRecord]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for chunk in records.chunks(INSERT_CHUNK) {
            let mut builder: QueryBuilder<'_, Postgres> = QueryBuilder::new(
                "INSERT INTO stock_feeds (timestamp, symbol, token, exchange, ltp, ltq, volume, \
                 turnover, change_amount, change_percent, bid_price, ask_price, bid_qty, ask_qty, \
                 total_buy_qty, total_sell_qty, last_trade_time, feed_time, raw_data) ",
            );
            builder.push_values(chunk, |mut row, record| {
                row.push_bind(record.received_at)
                    .push_bind(record.symbol.as_deref())
                    .push_bind(record.token())
                    .push_bind(record.exchange().as_str())
                    .push_bind(record.last_price)
                    .push_bind(record.last_quantity)
                    .push_bind(record.volume)
                    .push_bind(record.turnover)
                    .push_bind(record.change_amount)
                    .push_bind(record.change_percent)
                    .push_bind(record.bid_price)
                    .push_bind(record.ask_price)
                    .push_bind(record.bid_quantity)
                    .push_bind(record.ask_quantity)
                    .push_bind(record.total_buy_quantity)
                    .push_bind(record.total_sell_quantity)
                    .push_bind(record.last_trade_time)
                    .push_bind(record.feed_time)
                    .push_bind(&record.raw);
            });
            builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        tracing::debug!(records = records.len(), "Batch committed");
        Ok(())
    }

    async fn upsert_stats(&self, stats: &IngestionStats) -> Result<(), StoreError> {
        sqlx::query(
            r"
            INSERT INTO ingestion_stats (
                id, records_processed, last_processed_at, batch_size, processing_time_ms, updated_at
            ) VALUES ($1, $2, $3, $4, $5, NOW())
            ON CONFLICT (id) DO UPDATE SET
                records_processed = EXCLUDED.records_processed,
                last_processed_at = EXCLUDED.last_processed_at,
                batch_size = EXCLUDED.batch_size,
                processing_time_ms = EXCLUDED.processing_time_ms,
                updated_at = NOW()
            ",
        )
        .bind(STATS_ROW_ID)
        .bind(to_db_count(stats.records_processed))
        .bind(stats.last_flush_at)
        .bind(to_db_count(stats.last_batch_size))
        .bind(to_db_count(stats.last_flush_duration_ms))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_stats(&self) -> Result<Option<IngestionStats>, StoreError> {
        let row = sqlx::query(
            r"
            SELECT records_processed, last_processed_at, batch_size, processing_time_ms
            FROM ingestion_stats
            WHERE id = $1
            ",
        )
        .bind(STATS_ROW_ID)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let last_flush_at: Option<DateTime<Utc>> = row.try_get("last_processed_at")?;
        Ok(Some(IngestionStats {
            records_processed: from_db_count(
                "records_processed",
                row.try_get("records_processed")?,
            )?,
            last_flush_at,
            last_batch_size: from_db_count("batch_size", row.try_get("batch_size")?)?,
            last_flush_duration_ms: from_db_count(
                "processing_time_ms",
                row.try_get("processing_time_ms")?,
            )?,
            ..IngestionStats::default()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_clamp_into_bigint() {
        assert_eq!(to_db_count(42), 42);
        assert_eq!(to_db_count(u64::MAX), i64::MAX);
    }

    #[test]
    fn negative_counts_are_invalid() {
        assert_eq!(from_db_count("batch_size", Some(7)).unwrap(), 7);
        assert_eq!(from_db_count("batch_size", None).unwrap(), 0);
        assert!(matches!(
            from_db_count("batch_size", Some(-1)),
            Err(StoreError::InvalidData { .. })
        ));
    }

    #[test]
    fn pool_errors_map_to_unavailable() {
        assert!(matches!(
            StoreError::from(sqlx::Error::PoolTimedOut),
            StoreError::Unavailable { .. }
        ));
        assert!(matches!(
            StoreError::from(sqlx::Error::RowNotFound),
            StoreError::Query { .. }
        ));
    }

    #[tokio::test]
    async fn empty_batch_skips_the_database() {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://ingest@127.0.0.1:1/feeds")
            .unwrap();
        let store = PostgresFeedStore::new(pool);
        store.write_batch(&[]).await.unwrap();
    }
}
