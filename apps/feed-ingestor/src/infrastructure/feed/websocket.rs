//! WebSocket Feed Source
//!
//! Connects to a push market-data feed, sends one subscription request for
//! the configured instruments, and hands every text frame to the engine's
//! sink wrapped in the `[Res]:` response envelope.
//!
//! # Protocol
//!
//! On connect the client sends:
//!
//! ```json
//! {"action":"subscribe","instruments":[{"instrument_token":"2885","exchange_segment":"nse_cm"}]}
//! ```
//!
//! Server frames are forwarded untouched apart from the envelope. A dropped
//! connection is re-established with exponential backoff until the source is
//! unsubscribed.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::FeedHealth;
use crate::application::ports::{FeedSink, FeedSource, FeedSourceError};
use crate::application::services::backoff::{BackoffConfig, BackoffPolicy};
use crate::application::services::parser::ENVELOPE_PREFIX;
use crate::domain::subscription::InstrumentKey;

const SOURCE_NAME: &str = "websocket";

// =============================================================================
// Error Type
// =============================================================================

/// Errors that end a single connection.
#[derive(Debug, thiserror::Error)]
pub enum WebSocketFeedError {
    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The subscription request could not be encoded.
    #[error("failed to encode subscription request: {0}")]
    Encode(#[from] serde_json::Error),

    /// The server closed the connection.
    #[error("connection closed")]
    ConnectionClosed,
}

// =============================================================================
// Configuration
// =============================================================================

/// WebSocket feed configuration.
#[derive(Debug, Clone)]
pub struct WebSocketFeedConfig {
    /// Feed URL (`ws://` or `wss://`).
    pub url: String,
    /// Delay schedule between reconnection attempts.
    pub reconnect: BackoffConfig,
}

impl WebSocketFeedConfig {
    /// Configuration with the default reconnect schedule.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect: BackoffConfig::for_reconnect(),
        }
    }

    /// Override the reconnect schedule.
    #[must_use]
    pub fn with_reconnect(mut self, reconnect: BackoffConfig) -> Self {
        self.reconnect = reconnect;
        self
    }
}

#[derive(Debug, Serialize)]
struct InstrumentRef<'a> {
    instrument_token: &'a str,
    exchange_segment: &'a str,
}

#[derive(Debug, Serialize)]
struct SubscriptionRequest<'a> {
    action: &'static str,
    instruments: Vec<InstrumentRef<'a>>,
}

fn subscription_frame(
    action: &'static str,
    instruments: &[InstrumentKey],
) -> Result<String, serde_json::Error> {
    serde_json::to_string(&SubscriptionRequest {
        action,
        instruments: instruments
            .iter()
            .map(|key| InstrumentRef {
                instrument_token: &key.token,
                exchange_segment: key.exchange.as_str(),
            })
            .collect(),
    })
}

/// Wrap a server frame in the response envelope unless it already carries it.
fn envelope(text: &str) -> String {
    if text.trim_start().starts_with(ENVELOPE_PREFIX) {
        text.to_string()
    } else {
        format!("{ENVELOPE_PREFIX} {text}")
    }
}

// =============================================================================
// Feed Source
// =============================================================================

struct Session {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Push feed over WebSocket.
pub struct WebSocketFeed {
    config: WebSocketFeedConfig,
    health: Arc<FeedHealth>,
    session: Mutex<Option<Session>>,
}

impl WebSocketFeed {
    /// Create an idle feed source.
    #[must_use]
    pub fn new(config: WebSocketFeedConfig) -> Self {
        Self {
            config,
            health: Arc::new(FeedHealth::new(SOURCE_NAME)),
            session: Mutex::new(None),
        }
    }

    /// Shared connection state.
    #[must_use]
    pub fn health(&self) -> Arc<FeedHealth> {
        Arc::clone(&self.health)
    }
}

#[async_trait]
impl FeedSource for WebSocketFeed {
    async fn subscribe(
        &self,
        instruments: &[InstrumentKey],
        sink: FeedSink,
    ) -> Result<(), FeedSourceError> {
        let mut session = self.session.lock();
        if session.is_some() {
            return Err(FeedSourceError::AlreadySubscribed);
        }

        let cancel = CancellationToken::new();
        let connection = Connection {
            config: self.config.clone(),
            instruments: instruments.to_vec(),
            sink,
            health: Arc::clone(&self.health),
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(connection.run());

        tracing::info!(
            url = %self.config.url,
            instruments = instruments.len(),
            "WebSocket feed subscribed"
        );
        *session = Some(Session { cancel, handle });
        Ok(())
    }

    async fn unsubscribe(&self) -> Result<(), FeedSourceError> {
        let session = self.session.lock().take();
        let Some(session) = session else {
            return Ok(());
        };

        session.cancel.cancel();
        if let Err(e) = session.handle.await {
            tracing::warn!(error = %e, "WebSocket feed task ended abnormally");
        }
        self.health.set_connected(false);
        tracing::info!("WebSocket feed unsubscribed");
        Ok(())
    }

    fn name(&self) -> &'static str {
        SOURCE_NAME
    }
}

// =============================================================================
// Connection Loop
// =============================================================================

struct Connection {
    config: WebSocketFeedConfig,
    instruments: Vec<InstrumentKey>,
    sink: FeedSink,
    health: Arc<FeedHealth>,
    cancel: CancellationToken,
}

impl Connection {
    async fn run(self) {
        let mut backoff = BackoffPolicy::new(self.config.reconnect.clone());

        loop {
            if self.cancel.is_cancelled() {
                return;
            }

            match self.connect_and_run(&mut backoff).await {
                Ok(()) => return,
                Err(e) => {
                    self.health.set_connected(false);
                    tracing::warn!(error = %e, "WebSocket feed connection error");

                    let Some(delay) = backoff.next_delay() else {
                        tracing::error!(
                            attempts = backoff.retries(),
                            "WebSocket feed gave up reconnecting"
                        );
                        return;
                    };
                    self.health.record_reconnect();
                    tracing::info!(
                        attempt = backoff.retries(),
                        delay_ms = delay.as_millis(),
                        "Reconnecting to feed"
                    );

                    tokio::select! {
                        () = self.cancel.cancelled() => return,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Returns `Ok` only when cancelled.
    async fn connect_and_run(
        &self,
        backoff: &mut BackoffPolicy,
    ) -> Result<(), WebSocketFeedError> {
        tracing::info!(url = %self.config.url, "Connecting to feed");

        let (ws_stream, _response) = tokio::select! {
            () = self.cancel.cancelled() => return Ok(()),
            result = tokio_tungstenite::connect_async(self.config.url.as_str()) => result?,
        };
        let (mut write, mut read) = ws_stream.split();

        if !self.instruments.is_empty() {
            let frame = subscription_frame("subscribe", &self.instruments)?;
            write.send(Message::Text(frame.into())).await?;
        }

        self.health.set_connected(true);
        backoff.reset();
        tracing::info!(instruments = self.instruments.len(), "Feed connected");

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    if !self.instruments.is_empty() {
                        let frame = subscription_frame("unsubscribe", &self.instruments)?;
                        if let Err(e) = write.send(Message::Text(frame.into())).await {
                            tracing::debug!(error = %e, "Unsubscribe frame not sent");
                        }
                    }
                    if let Err(e) = write.close().await {
                        tracing::debug!(error = %e, "Feed close handshake failed");
                    }
                    return Ok(());
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => self.forward(text.as_str()),
                        Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                            Ok(text) => self.forward(text),
                            Err(_) => tracing::debug!(len = bytes.len(), "Ignoring non-UTF-8 binary frame"),
                        },
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) => {
                            tracing::info!("Server sent close frame");
                            return Err(WebSocketFeedError::ConnectionClosed);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                        None => return Err(WebSocketFeedError::ConnectionClosed),
                    }
                }
            }
        }
    }

    fn forward(&self, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        let accepted = self.sink.deliver(envelope(text));
        self.health.record_payload(accepted);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    use super::*;
    use crate::domain::subscription::ExchangeSegment;

    fn fast_reconnect(url: String) -> WebSocketFeedConfig {
        WebSocketFeedConfig::new(url).with_reconnect(
            BackoffConfig {
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(50),
                ..BackoffConfig::for_reconnect()
            }
            .without_jitter(),
        )
    }

    fn collecting_sink() -> (FeedSink, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = FeedSink::new(move |message| tx.send(message.payload).is_ok());
        (sink, rx)
    }

    #[test]
    fn subscription_frame_lists_instruments() {
        let frame = subscription_frame(
            "subscribe",
            &[InstrumentKey::new("2885", ExchangeSegment::NseCm)],
        )
        .unwrap();
        assert_eq!(
            frame,
            r#"{"action":"subscribe","instruments":[{"instrument_token":"2885","exchange_segment":"nse_cm"}]}"#
        );
    }

    #[test]
    fn envelope_is_added_once() {
        assert_eq!(envelope(r#"{"a":1}"#), r#"[Res]: {"a":1}"#);
        assert_eq!(envelope(r#"[Res]: {"a":1}"#), r#"[Res]: {"a":1}"#);
    }

    #[tokio::test]
    async fn forwards_frames_after_subscribing() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

            let request = ws.next().await.unwrap().unwrap();
            let request = request.into_text().unwrap().as_str().to_owned();

            let body = r#"{"type":"stock_feed","data":[{"tk":"2885","e":"nse_cm","ltp":"1450.25"}]}"#;
            ws.send(Message::Text(body.to_string().into())).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
            request
        });

        let feed = WebSocketFeed::new(fast_reconnect(url));
        let (sink, mut rx) = collecting_sink();
        let instruments = [InstrumentKey::new("2885", ExchangeSegment::NseCm)];
        feed.subscribe(&instruments, sink.clone()).await.unwrap();

        let payload = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(payload.starts_with("[Res]: "));
        assert!(payload.contains("1450.25"));
        assert!(feed.health().is_connected());

        assert!(matches!(
            feed.subscribe(&instruments, sink).await,
            Err(FeedSourceError::AlreadySubscribed)
        ));

        feed.unsubscribe().await.unwrap();
        assert!(!feed.health().is_connected());

        let request = server.await.unwrap();
        assert!(request.contains(r#""action":"subscribe""#));
        assert!(request.contains("2885"));
    }

    #[tokio::test]
    async fn reconnects_after_server_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.close(None).await.unwrap();
            drop(ws);

            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Text(r#"{"type":"stock_feed","data":[]}"#.to_string().into()))
                .await
                .unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });

        let feed = WebSocketFeed::new(fast_reconnect(url));
        let (sink, mut rx) = collecting_sink();
        feed.subscribe(&[], sink).await.unwrap();

        let payload = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(payload.contains("stock_feed"));
        assert!(feed.health().snapshot().reconnects >= 1);

        feed.unsubscribe().await.unwrap();
    }

    #[tokio::test]
    async fn unsubscribe_sends_frame_then_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let mut requests = Vec::new();
            while let Some(Ok(message)) = ws.next().await {
                match message {
                    Message::Text(text) => requests.push(text.as_str().to_owned()),
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            requests
        });

        let feed = WebSocketFeed::new(fast_reconnect(url));
        let (sink, _rx) = collecting_sink();
        let instruments = [InstrumentKey::new("11536", ExchangeSegment::NseCm)];
        feed.subscribe(&instruments, sink).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while !feed.health().is_connected() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        feed.unsubscribe().await.unwrap();

        let requests = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].contains(r#""action":"subscribe""#));
        assert!(requests[1].contains(r#""action":"unsubscribe""#));
        assert!(requests[1].contains("11536"));
    }

    #[tokio::test]
    async fn unsubscribe_without_session_is_noop() {
        let feed = WebSocketFeed::new(WebSocketFeedConfig::new("ws://127.0.0.1:9"));
        feed.unsubscribe().await.unwrap();
        assert_eq!(feed.name(), "websocket");
    }
}
