//! Replay Feed Source
//!
//! Replays a captured feed log: one payload per line, delivered from a
//! dedicated reader thread. Only lines carrying the `[Res]:` envelope are
//! delivered; log noise around them is skipped.
//!
//! The source signals completion through [`ReplayFeed::finished`] once the
//! file is exhausted, so a one-shot backfill can shut the engine down.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::FeedHealth;
use crate::application::ports::{FeedSink, FeedSource, FeedSourceError};
use crate::application::services::parser::ENVELOPE_PREFIX;
use crate::domain::subscription::InstrumentKey;

const SOURCE_NAME: &str = "replay";

struct Reader {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Line-delimited payload file replayed into the engine.
pub struct ReplayFeed {
    path: PathBuf,
    interval: Duration,
    health: Arc<FeedHealth>,
    finished: CancellationToken,
    reader: Mutex<Option<Reader>>,
}

impl ReplayFeed {
    /// Replay `path`, pausing `interval` between payloads.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            path: path.into(),
            interval,
            health: Arc::new(FeedHealth::new(SOURCE_NAME)),
            finished: CancellationToken::new(),
            reader: Mutex::new(None),
        }
    }

    /// Shared source state.
    #[must_use]
    pub fn health(&self) -> Arc<FeedHealth> {
        Arc::clone(&self.health)
    }

    /// Token cancelled when the reader thread has delivered the whole file
    /// or was stopped.
    #[must_use]
    pub fn finished(&self) -> CancellationToken {
        self.finished.clone()
    }
}

#[async_trait]
impl FeedSource for ReplayFeed {
    async fn subscribe(
        &self,
        _instruments: &[InstrumentKey],
        sink: FeedSink,
    ) -> Result<(), FeedSourceError> {
        let mut reader = self.reader.lock();
        if reader.is_some() {
            return Err(FeedSourceError::AlreadySubscribed);
        }

        let file = File::open(&self.path).map_err(|e| FeedSourceError::Unavailable {
            message: format!("{}: {e}", self.path.display()),
        })?;

        let stop = Arc::new(AtomicBool::new(false));
        let task = ReplayTask {
            lines: BufReader::new(file),
            interval: self.interval,
            sink,
            health: Arc::clone(&self.health),
            stop: Arc::clone(&stop),
            finished: self.finished.clone(),
        };
        let handle = std::thread::Builder::new()
            .name("feed-replay".to_string())
            .spawn(move || task.run())
            .map_err(|e| FeedSourceError::Unavailable {
                message: format!("failed to start reader thread: {e}"),
            })?;

        self.health.set_connected(true);
        tracing::info!(path = %self.path.display(), "Replay feed started");
        *reader = Some(Reader { stop, handle });
        Ok(())
    }

    async fn unsubscribe(&self) -> Result<(), FeedSourceError> {
        let reader = self.reader.lock().take();
        let Some(reader) = reader else {
            return Ok(());
        };

        reader.stop.store(true, Ordering::Relaxed);
        let joined = tokio::task::spawn_blocking(move || reader.handle.join()).await;
        if !matches!(joined, Ok(Ok(()))) {
            tracing::warn!("Replay reader thread ended abnormally");
        }
        self.health.set_connected(false);
        Ok(())
    }

    fn name(&self) -> &'static str {
        SOURCE_NAME
    }
}

struct ReplayTask {
    lines: BufReader<File>,
    interval: Duration,
    sink: FeedSink,
    health: Arc<FeedHealth>,
    stop: Arc<AtomicBool>,
    finished: CancellationToken,
}

impl ReplayTask {
    fn run(self) {
        let mut delivered = 0_u64;
        let mut skipped = 0_u64;

        for line in self.lines.lines() {
            if self.stop.load(Ordering::Relaxed) {
                break;
            }
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    tracing::error!(error = %e, "Replay read failed");
                    break;
                }
            };

            let payload = line.trim();
            if !payload.starts_with(ENVELOPE_PREFIX) {
                if !payload.is_empty() {
                    skipped += 1;
                }
                continue;
            }

            let accepted = self.sink.deliver(payload);
            self.health.record_payload(accepted);
            delivered += 1;

            if !self.interval.is_zero() {
                std::thread::sleep(self.interval);
            }
        }

        tracing::info!(delivered, skipped, "Replay feed finished");
        self.finished.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    fn capture(lines: &[&str]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        file
    }

    #[tokio::test]
    async fn delivers_enveloped_lines_only() {
        let file = capture(&[
            "2024-03-01 09:15:00 INFO connected",
            r#"[Res]: {"type":"stock_feed","data":[{"tk":"2885","ltp":"1450.25"}]}"#,
            "",
            r#"[Res]: {"type":"stock_feed","data":[]}"#,
        ]);

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink_store = Arc::clone(&received);
        let sink = FeedSink::new(move |message| {
            sink_store.lock().push(message.payload);
            true
        });

        let feed = ReplayFeed::new(file.path(), Duration::ZERO);
        let finished = feed.finished();
        feed.subscribe(&[], sink).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), finished.cancelled())
            .await
            .unwrap();
        feed.unsubscribe().await.unwrap();

        let received = received.lock();
        assert_eq!(received.len(), 2);
        assert!(received[0].contains("1450.25"));
        assert_eq!(feed.health().snapshot().payloads_delivered, 2);
        assert!(!feed.health().is_connected());
    }

    #[tokio::test]
    async fn missing_file_is_unavailable() {
        let feed = ReplayFeed::new("/nonexistent/feed.log", Duration::ZERO);
        let result = feed.subscribe(&[], FeedSink::new(|_| true)).await;
        assert!(matches!(result, Err(FeedSourceError::Unavailable { .. })));
    }

    #[tokio::test]
    async fn rejects_second_subscription() {
        let file = capture(&[r#"[Res]: {"type":"stock_feed","data":[]}"#]);
        let feed = ReplayFeed::new(file.path(), Duration::from_millis(50));

        feed.subscribe(&[], FeedSink::new(|_| true)).await.unwrap();
        let second = feed.subscribe(&[], FeedSink::new(|_| true)).await;
        assert!(matches!(second, Err(FeedSourceError::AlreadySubscribed)));

        feed.unsubscribe().await.unwrap();
    }
}
