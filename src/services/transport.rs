//! Upstream event-stream connections.
//!
//! Opening a connection never blocks: the transport hands back a connection
//! immediately and delivers frames (or transport errors) to subscribers as
//! they arrive, much like a browser `EventSource`.

use futures::StreamExt;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use reqwest::Client;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::services::sse::{SseDecoder, SseFrame, SseItem};

/// Events buffered per upstream before slow subscribers start lagging.
const EVENT_BUFFER: usize = 64;

/// Delay before an HTTP upstream reconnects after the body ends or fails.
const RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// What an upstream delivers to its subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Frame(SseFrame),
    Heartbeat,
    /// The connection dropped or produced undecodable data. No payload.
    TransportError(String),
}

impl From<SseItem> for StreamEvent {
    fn from(item: SseItem) -> Self {
        match item {
            SseItem::Frame(frame) => StreamEvent::Frame(frame),
            SseItem::Heartbeat => StreamEvent::Heartbeat,
            SseItem::Invalid(e) => StreamEvent::TransportError(e.to_string()),
        }
    }
}

/// One live upstream stream, shared by every subscriber of its URL.
pub trait UpstreamConnection: Send + Sync {
    fn url(&self) -> &str;

    fn subscribe(&self) -> broadcast::Receiver<StreamEvent>;

    /// Close the upstream. Closing an already closed connection is `Ok`.
    fn close(&self) -> Result<(), TransportError>;

    fn is_closed(&self) -> bool;
}

pub trait StreamTransport: Send + Sync {
    fn open(&self, url: &str) -> Arc<dyn UpstreamConnection>;
}

/// SSE over HTTP using reqwest, reconnecting while the connection is open.
pub struct HttpTransport {
    http: Client,
    api_token: Option<String>,
}

impl HttpTransport {
    pub fn new(api_token: Option<String>) -> Result<Self, TransportError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { http, api_token })
    }
}

impl StreamTransport for HttpTransport {
    fn open(&self, url: &str) -> Arc<dyn UpstreamConnection> {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        let task = tokio::spawn(run_http_stream(
            self.http.clone(),
            url.to_string(),
            self.api_token.clone(),
            tx.clone(),
        ));
        tracing::debug!(url = %url, "Opened HTTP event stream");
        Arc::new(HttpConnection {
            url: url.to_string(),
            tx,
            closed: AtomicBool::new(false),
            task: Mutex::new(Some(task)),
        })
    }
}

struct HttpConnection {
    url: String,
    tx: broadcast::Sender<StreamEvent>,
    closed: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl UpstreamConnection for HttpConnection {
    fn url(&self) -> &str {
        &self.url
    }

    fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.tx.subscribe()
    }

    fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut task = self.task.lock().map_err(|e| TransportError::Close {
            url: self.url.clone(),
            reason: e.to_string(),
        })?;
        if let Some(task) = task.take() {
            task.abort();
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

async fn run_http_stream(
    http: Client,
    url: String,
    api_token: Option<String>,
    tx: broadcast::Sender<StreamEvent>,
) {
    loop {
        let reason = match pump_once(&http, &url, api_token.as_deref(), &tx).await {
            Ok(()) => "Event stream ended by server".to_string(),
            Err(e) => e.to_string(),
        };
        tracing::warn!(url = %url, reason = %reason, "Event stream interrupted");
        let _ = tx.send(StreamEvent::TransportError(reason));
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

async fn pump_once(
    http: &Client,
    url: &str,
    api_token: Option<&str>,
    tx: &broadcast::Sender<StreamEvent>,
) -> Result<(), TransportError> {
    let mut request = http
        .get(url)
        .header(ACCEPT, "text/event-stream")
        .header(CACHE_CONTROL, "no-cache");
    if let Some(token) = api_token {
        request = request.bearer_auth(token);
    }

    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(TransportError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }

    let mut decoder = SseDecoder::new();
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        for item in decoder.feed(&chunk) {
            if let SseItem::Invalid(e) = &item {
                tracing::warn!(url = %url, error = %e, "Skipping undecodable event line");
            }
            let _ = tx.send(item.into());
        }
    }
    Ok(())
}

/// In-process transport. Producers push events with [`LoopbackTransport::emit`];
/// opens and closes are counted so callers can observe connection sharing.
#[derive(Default)]
pub struct LoopbackTransport {
    connections: Mutex<HashMap<String, Arc<LoopbackConnection>>>,
    opened: AtomicUsize,
    closed: Arc<AtomicUsize>,
    fail_close: AtomicBool,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later `close` report a transport failure.
    pub fn fail_on_close(&self, fail: bool) {
        self.fail_close.store(fail, Ordering::SeqCst);
    }

    /// Deliver an event to the current connection for `url`.
    /// Returns how many subscribers received it.
    pub fn emit(&self, url: &str, event: StreamEvent) -> usize {
        let connection = match self.connections.lock() {
            Ok(connections) => connections.get(url).cloned(),
            Err(e) => {
                tracing::error!("Mutex poisoned reading loopback connections: {e}");
                None
            }
        };
        match connection {
            Some(conn) if !conn.is_closed() => conn.tx.send(event).unwrap_or(0),
            _ => 0,
        }
    }

    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_open(&self, url: &str) -> bool {
        match self.connections.lock() {
            Ok(connections) => connections.get(url).is_some_and(|c| !c.is_closed()),
            Err(_) => false,
        }
    }
}

impl StreamTransport for LoopbackTransport {
    fn open(&self, url: &str) -> Arc<dyn UpstreamConnection> {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        let connection = Arc::new(LoopbackConnection {
            url: url.to_string(),
            tx,
            closed: AtomicBool::new(false),
            close_count: Arc::clone(&self.closed),
            fail_close: self.fail_close.load(Ordering::SeqCst),
        });
        self.opened.fetch_add(1, Ordering::SeqCst);
        match self.connections.lock() {
            Ok(mut connections) => {
                connections.insert(url.to_string(), Arc::clone(&connection));
            }
            Err(e) => tracing::error!("Mutex poisoned writing loopback connections: {e}"),
        }
        connection
    }
}

struct LoopbackConnection {
    url: String,
    tx: broadcast::Sender<StreamEvent>,
    closed: AtomicBool,
    close_count: Arc<AtomicUsize>,
    fail_close: bool,
}

impl UpstreamConnection for LoopbackConnection {
    fn url(&self) -> &str {
        &self.url
    }

    fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.tx.subscribe()
    }

    fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.close_count.fetch_add(1, Ordering::SeqCst);
        if self.fail_close {
            return Err(TransportError::Close {
                url: self.url.clone(),
                reason: "loopback configured to fail on close".to_string(),
            });
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Upstream {url} returned status {status}")]
    Status { url: String, status: u16 },

    #[error("Failed to close upstream {url}: {reason}")]
    Close { url: String, reason: String },
}
