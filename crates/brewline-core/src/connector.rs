//! Stream connector: one long-lived WebSocket subscription to the firehose.
//!
//! ```text
//!   Disconnected ──▶ Connecting ──▶ Connected ──(error)──▶ Disconnected
//!                                       │                       │
//!                                       └──(shutdown)──▶ Stopping ──▶ Stopped
//! ```
//!
//! Every failure rotates to the next endpoint and sleeps an exponentially
//! growing, capped backoff before trying again. Only the shutdown signal ends
//! the loop. Raw frames (inflated if compressed) go to a bounded channel, so a
//! slow router pushes back on the socket instead of buffering without limit.

use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::StreamConfig;
use crate::error::{DecodeError, Result};
use crate::records::RecordType;
use crate::retry::RetryPolicy;
use crate::storage::IndexStore;

/// Leading bytes of a zstd frame.
pub const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Stopping = 3,
    Stopped = 4,
}

impl ConnectionState {
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Stopping,
            4 => Self::Stopped,
            _ => Self::Disconnected,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Where the resume position comes from.
pub trait CursorSource: Send + Sync {
    /// Last persisted event time, microseconds since the epoch.
    fn load_cursor(&self) -> Result<Option<i64>>;
}

impl CursorSource for IndexStore {
    fn load_cursor(&self) -> Result<Option<i64>> {
        Self::load_cursor(self)
    }
}

/// Inflates zstd frames, optionally with a shared dictionary.
#[derive(Debug, Clone, Default)]
pub struct FrameDecompressor {
    dictionary: Option<Vec<u8>>,
}

impl FrameDecompressor {
    #[must_use]
    pub fn new(dictionary: Option<Vec<u8>>) -> Self {
        Self { dictionary }
    }

    #[must_use]
    pub fn is_compressed(frame: &[u8]) -> bool {
        frame.starts_with(&ZSTD_MAGIC)
    }

    /// Return the frame as JSON bytes and whether it had to be inflated.
    pub fn inflate(&self, frame: Vec<u8>) -> std::result::Result<(Vec<u8>, bool), DecodeError> {
        if !Self::is_compressed(&frame) {
            return Ok((frame, false));
        }
        let mut out = Vec::with_capacity(frame.len() * 4);
        let read = match &self.dictionary {
            Some(dict) => zstd::stream::read::Decoder::with_dictionary(&frame[..], dict)
                .and_then(|mut decoder| decoder.read_to_end(&mut out)),
            None => zstd::stream::read::Decoder::new(&frame[..])
                .and_then(|mut decoder| decoder.read_to_end(&mut out)),
        };
        read.map_err(|e| DecodeError::Decompress(e.to_string()))?;
        Ok((out, true))
    }
}

/// Point-in-time connector counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorSnapshot {
    pub state: ConnectionState,
    pub endpoint: String,
    pub messages: u64,
    pub bytes: u64,
    pub decompressed: u64,
    pub reconnects: u64,
    pub errors: u64,
    pub last_event_time_us: Option<i64>,
}

#[derive(Debug, Default)]
struct ConnectorCounters {
    messages: AtomicU64,
    bytes: AtomicU64,
    decompressed: AtomicU64,
    reconnects: AtomicU64,
    errors: AtomicU64,
    last_event_time_us: AtomicI64,
}

enum SessionEnd {
    Shutdown,
    ReceiverClosed,
    Failed(String),
}

pub struct StreamConnector {
    endpoints: Vec<Url>,
    wanted: Vec<RecordType>,
    compress: bool,
    handshake_timeout: Duration,
    idle_timeout: Duration,
    rewind_us: i64,
    retry: RetryPolicy,
    cursor_source: Arc<dyn CursorSource>,
    decompressor: FrameDecompressor,
    state: AtomicU8,
    endpoint_index: AtomicUsize,
    counters: ConnectorCounters,
}

impl StreamConnector {
    /// Build a connector from configuration, loading the zstd dictionary if
    /// one is configured.
    ///
    /// Every endpoint is parsed up front, so a bad URL fails here rather than
    /// inside the reconnect loop.
    pub fn new(config: &StreamConfig, cursor_source: Arc<dyn CursorSource>) -> Result<Self> {
        let endpoints = config.endpoint_urls()?;
        let dictionary = match &config.zstd_dictionary {
            Some(path) => Some(std::fs::read(crate::config::expand_home(path))?),
            None => None,
        };
        Ok(Self {
            endpoints,
            wanted: config.wanted_record_types()?,
            compress: config.compress,
            handshake_timeout: config.handshake_timeout(),
            idle_timeout: config.idle_timeout(),
            rewind_us: config.cursor_rewind_us.max(0),
            retry: RetryPolicy::stream_reconnect(config.initial_backoff(), config.max_backoff()),
            cursor_source,
            decompressor: FrameDecompressor::new(dictionary),
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            endpoint_index: AtomicUsize::new(0),
            counters: ConnectorCounters::default(),
        })
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    #[must_use]
    pub fn current_endpoint(&self) -> &Url {
        let idx = self.endpoint_index.load(Ordering::Relaxed) % self.endpoints.len();
        &self.endpoints[idx]
    }

    fn rotate_endpoint(&self) {
        self.endpoint_index.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the newest event time seen downstream.
    pub fn note_event_time(&self, time_us: i64) {
        self.counters
            .last_event_time_us
            .fetch_max(time_us, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> ConnectorSnapshot {
        let last = self.counters.last_event_time_us.load(Ordering::Relaxed);
        ConnectorSnapshot {
            state: self.state(),
            endpoint: self.current_endpoint().to_string(),
            messages: self.counters.messages.load(Ordering::Relaxed),
            bytes: self.counters.bytes.load(Ordering::Relaxed),
            decompressed: self.counters.decompressed.load(Ordering::Relaxed),
            reconnects: self.counters.reconnects.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            last_event_time_us: (last > 0).then_some(last),
        }
    }

    async fn resume_cursor(&self) -> Option<i64> {
        let source = Arc::clone(&self.cursor_source);
        match tokio::task::spawn_blocking(move || source.load_cursor()).await {
            Ok(Ok(cursor)) => cursor.map(|c| c.saturating_sub(self.rewind_us).max(0)),
            Ok(Err(err)) => {
                warn!(error = %err, "could not load stream cursor, starting live");
                None
            }
            Err(err) => {
                warn!(error = %err, "cursor load task failed, starting live");
                None
            }
        }
    }

    /// Run until `shutdown` flips to `true` or its sender is dropped.
    ///
    /// Connection failures are retried forever; the returned error is only
    /// ever a shutdown-time problem.
    pub async fn run(
        &self,
        tx: mpsc::Sender<Vec<u8>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut attempt = 0u32;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let endpoint = self.current_endpoint();
            self.set_state(ConnectionState::Connecting);
            let cursor = self.resume_cursor().await;
            let url = build_subscribe_url(endpoint, &self.wanted, self.compress, cursor);
            debug!(endpoint = %endpoint, cursor = ?cursor, "connecting to firehose");

            let handshake = tokio::time::timeout(
                self.handshake_timeout,
                tokio_tungstenite::connect_async(url.as_str()),
            );
            let connected = tokio::select! {
                _ = shutdown.changed() => break,
                result = handshake => result,
            };

            let reason = match connected {
                Ok(Ok((socket, _response))) => {
                    attempt = 0;
                    self.set_state(ConnectionState::Connected);
                    info!(endpoint = %endpoint, cursor = ?cursor, "firehose connected");
                    match self.read_session(socket, &tx, &mut shutdown).await {
                        SessionEnd::Shutdown => break,
                        SessionEnd::ReceiverClosed => {
                            debug!("frame receiver closed, connector stopping");
                            break;
                        }
                        SessionEnd::Failed(reason) => reason,
                    }
                }
                Ok(Err(err)) => format!("connect failed: {err}"),
                Err(_) => format!("handshake timed out after {:?}", self.handshake_timeout),
            };

            self.counters.errors.fetch_add(1, Ordering::Relaxed);
            self.set_state(ConnectionState::Disconnected);
            self.rotate_endpoint();
            let delay = self.retry.delay_for_attempt(attempt);
            attempt = attempt.saturating_add(1);
            warn!(
                endpoint = %endpoint,
                next_endpoint = %self.current_endpoint(),
                reason = %reason,
                delay_ms = delay.as_millis() as u64,
                "firehose disconnected, reconnecting"
            );

            tokio::select! {
                _ = shutdown.changed() => break,
                () = tokio::time::sleep(delay) => {}
            }
            self.counters.reconnects.fetch_add(1, Ordering::Relaxed);
        }

        self.set_state(ConnectionState::Stopping);
        info!("firehose connector stopped");
        self.set_state(ConnectionState::Stopped);
        Ok(())
    }

    async fn read_session<S>(
        &self,
        socket: WebSocketStream<S>,
        tx: &mpsc::Sender<Vec<u8>>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut sink, mut stream) = socket.split();

        loop {
            let next = tokio::select! {
                _ = shutdown.changed() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                }
                next = tokio::time::timeout(self.idle_timeout, stream.next()) => next,
            };

            let message = match next {
                Err(_) => {
                    return SessionEnd::Failed(format!(
                        "no message for {:?}",
                        self.idle_timeout
                    ));
                }
                Ok(None) => return SessionEnd::Failed("stream ended".into()),
                Ok(Some(Err(err))) => return SessionEnd::Failed(err.to_string()),
                Ok(Some(Ok(message))) => message,
            };

            let payload = match message {
                Message::Text(text) => text.into_bytes(),
                Message::Binary(bytes) => bytes,
                Message::Ping(data) => {
                    if let Err(err) = sink.send(Message::Pong(data)).await {
                        return SessionEnd::Failed(format!("pong failed: {err}"));
                    }
                    continue;
                }
                Message::Pong(_) | Message::Frame(_) => continue,
                Message::Close(frame) => {
                    let reason = frame.map_or_else(
                        || "closed by server".to_string(),
                        |f| format!("closed by server: {} {}", f.code, f.reason),
                    );
                    return SessionEnd::Failed(reason);
                }
            };

            self.counters.messages.fetch_add(1, Ordering::Relaxed);
            self.counters
                .bytes
                .fetch_add(payload.len() as u64, Ordering::Relaxed);

            let frame = match self.decompressor.inflate(payload) {
                Ok((frame, inflated)) => {
                    if inflated {
                        self.counters.decompressed.fetch_add(1, Ordering::Relaxed);
                    }
                    frame
                }
                Err(err) => {
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %err, "undecodable frame skipped");
                    continue;
                }
            };

            tokio::select! {
                _ = shutdown.changed() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                }
                sent = tx.send(frame) => {
                    if sent.is_err() {
                        let _ = sink.send(Message::Close(None)).await;
                        return SessionEnd::ReceiverClosed;
                    }
                }
            }
        }
    }
}

/// Subscription URL with one `wantedCollections` per type, the compression
/// flag and the resume cursor.
#[must_use]
pub fn build_subscribe_url(
    endpoint: &Url,
    wanted: &[RecordType],
    compress: bool,
    cursor: Option<i64>,
) -> Url {
    let mut url = endpoint.clone();
    {
        let mut query = url.query_pairs_mut();
        for record_type in wanted {
            query.append_pair("wantedCollections", record_type.nsid());
        }
        if compress {
            query.append_pair("compress", "true");
        }
        if let Some(cursor) = cursor {
            query.append_pair("cursor", &cursor.to_string());
        }
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConfigError, Error};
    use std::sync::Mutex;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    struct FixedCursor(Option<i64>);

    impl CursorSource for FixedCursor {
        fn load_cursor(&self) -> Result<Option<i64>> {
            Ok(self.0)
        }
    }

    fn config(endpoints: Vec<String>) -> StreamConfig {
        StreamConfig {
            endpoints,
            wanted_types: vec!["brew".into(), "like".into()],
            initial_backoff_ms: 5_000,
            max_backoff_ms: 10_000,
            handshake_timeout_ms: 2_000,
            ..StreamConfig::default()
        }
    }

    #[test]
    fn subscribe_url_repeats_collections() {
        let endpoint = Url::parse("wss://jetstream.example/subscribe").unwrap();
        let url = build_subscribe_url(
            &endpoint,
            &[RecordType::Brew, RecordType::Like],
            true,
            Some(1_700_000_000_000_000),
        );
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("wantedCollections".into(), "social.brewline.brew".into()),
                ("wantedCollections".into(), "social.brewline.like".into()),
                ("compress".into(), "true".into()),
                ("cursor".into(), "1700000000000000".into()),
            ]
        );
        assert_eq!(
            build_subscribe_url(&endpoint, &[], false, None).as_str(),
            "wss://jetstream.example/subscribe"
        );
    }

    #[test]
    fn zstd_frames_are_inflated() {
        let json = br#"{"did":"did:plc:a","time_us":1,"kind":"identity"}"#;
        let compressed = zstd::stream::encode_all(&json[..], 3).unwrap();
        assert!(FrameDecompressor::is_compressed(&compressed));

        let decompressor = FrameDecompressor::default();
        let (out, inflated) = decompressor.inflate(compressed).unwrap();
        assert!(inflated);
        assert_eq!(out, json.to_vec());

        let (plain, inflated) = decompressor.inflate(json.to_vec()).unwrap();
        assert!(!inflated);
        assert_eq!(plain, json.to_vec());

        let mut broken = ZSTD_MAGIC.to_vec();
        broken.extend_from_slice(b"garbage");
        assert!(matches!(
            decompressor.inflate(broken),
            Err(DecodeError::Decompress(_))
        ));
    }

    #[test]
    fn endpoints_rotate() {
        let connector = StreamConnector::new(
            &config(vec!["wss://a.example".into(), "wss://b.example".into()]),
            Arc::new(FixedCursor(None)),
        )
        .unwrap();
        assert_eq!(connector.current_endpoint().as_str(), "wss://a.example/");
        connector.rotate_endpoint();
        assert_eq!(connector.current_endpoint().as_str(), "wss://b.example/");
        connector.rotate_endpoint();
        assert_eq!(connector.current_endpoint().as_str(), "wss://a.example/");
        assert_eq!(connector.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn empty_endpoint_list_is_rejected() {
        assert!(StreamConnector::new(&config(vec![]), Arc::new(FixedCursor(None))).is_err());
    }

    #[test]
    fn malformed_endpoints_are_rejected_up_front() {
        for bad in ["not a url", "https://jetstream.example/subscribe"] {
            let endpoints = vec!["wss://ok.example/subscribe".to_string(), bad.to_string()];
            let err = StreamConnector::new(&config(endpoints), Arc::new(FixedCursor(None)))
                .err()
                .unwrap_or_else(|| panic!("{bad} should be rejected"));
            assert!(
                matches!(err, Error::Config(ConfigError::ValidationError(ref msg)) if msg.contains(bad)),
                "unexpected error for {bad}: {err}"
            );
        }
    }

    #[tokio::test]
    async fn stops_promptly_while_backing_off() {
        let connector = Arc::new(
            StreamConnector::new(
                &config(vec!["ws://127.0.0.1:1/subscribe".into()]),
                Arc::new(FixedCursor(None)),
            )
            .unwrap(),
        );
        let (tx, _rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let runner = Arc::clone(&connector);
        let handle = tokio::spawn(async move { runner.run(tx, shutdown_rx).await });

        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown_tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("connector should stop within the timeout")
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(connector.state(), ConnectionState::Stopped);
        assert!(connector.snapshot().errors >= 1);
    }

    #[tokio::test]
    async fn delivers_frames_from_live_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen_uri = Arc::new(Mutex::new(String::new()));

        let server_uri = Arc::clone(&seen_uri);
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let callback = move |req: &Request, resp: Response| -> std::result::Result<Response, ErrorResponse> {
                *server_uri.lock().unwrap() = req.uri().to_string();
                Ok(resp)
            };
            let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback).await.unwrap();
            let plain = r#"{"did":"did:plc:a","time_us":10,"kind":"identity"}"#;
            ws.send(Message::Text(plain.to_string())).await.unwrap();
            let compressed = zstd::stream::encode_all(plain.as_bytes(), 3).unwrap();
            ws.send(Message::Binary(compressed)).await.unwrap();
            // Hold the socket open until the client closes it
            while let Some(Ok(message)) = ws.next().await {
                if message.is_close() {
                    break;
                }
            }
        });

        let connector = Arc::new(
            StreamConnector::new(
                &config(vec![format!("ws://{addr}/subscribe")]),
                Arc::new(FixedCursor(Some(10_000_000))),
            )
            .unwrap(),
        );
        let (tx, mut rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = Arc::clone(&connector);
        let handle = tokio::spawn(async move { runner.run(tx, shutdown_rx).await });

        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(connector.state(), ConnectionState::Connected);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
        server.await.unwrap();

        let uri = seen_uri.lock().unwrap().clone();
        assert!(uri.contains("wantedCollections=social.brewline.brew"));
        assert!(uri.contains("compress=true"));
        // 10s cursor rewound by the default 5s window
        assert!(uri.contains("cursor=5000000"));

        let snapshot = connector.snapshot();
        assert_eq!(snapshot.messages, 2);
        assert_eq!(snapshot.decompressed, 1);
        assert_eq!(snapshot.state, ConnectionState::Stopped);
    }
}
