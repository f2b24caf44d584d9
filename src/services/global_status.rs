//! Single shared stream of organization and system-wide queue metrics.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::models::events::QueueStatus;
use crate::services::pool::ConnectionPool;
use crate::services::sse::is_heartbeat;
use crate::services::transport::StreamEvent;

const SUBSCRIBER_ID: &str = "global-status";

struct BroadcasterInner {
    pool: Arc<ConnectionPool>,
    url: String,
    debounce: Duration,
    latest: watch::Sender<Option<QueueStatus>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Pushes the latest `queue_status` frame to any number of watchers.
///
/// `start` waits `debounce` before joining the pooled upstream so that many
/// components mounting together open a single connection.
#[derive(Clone)]
pub struct GlobalStatusBroadcaster {
    inner: Arc<BroadcasterInner>,
}

impl GlobalStatusBroadcaster {
    pub fn new(pool: Arc<ConnectionPool>, url: String, debounce: Duration) -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            inner: Arc::new(BroadcasterInner {
                pool,
                url,
                debounce,
                latest,
                task: Mutex::new(None),
            }),
        }
    }

    /// Schedule the stream. Calls made while a start is pending or the
    /// stream is running are collapsed into the first one.
    pub fn start(&self) {
        let mut task = self.inner.task();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            tracing::debug!(url = %self.inner.url, "Global status stream already scheduled");
            return;
        }
        let inner = Arc::clone(&self.inner);
        *task = Some(tokio::spawn(async move {
            tokio::time::sleep(inner.debounce).await;
            inner.run().await;
        }));
    }

    /// Cancel a pending start or leave the upstream.
    pub fn stop(&self) {
        if let Some(task) = self.inner.task().take() {
            task.abort();
        }
        if self.inner.pool.unsubscribe(&self.inner.url, SUBSCRIBER_ID) {
            tracing::info!(url = %self.inner.url, "Stopped global status stream");
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<QueueStatus>> {
        self.inner.latest.subscribe()
    }

    pub fn latest(&self) -> Option<QueueStatus> {
        self.inner.latest.borrow().clone()
    }
}

impl BroadcasterInner {
    fn task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Global status mutex poisoned, recovering");
            poisoned.into_inner()
        })
    }

    async fn run(&self) {
        let handle = self.pool.get_connection(&self.url, SUBSCRIBER_ID);
        let mut rx = handle.subscribe();
        tracing::info!(url = %self.url, "Global status stream connected");

        loop {
            match rx.recv().await {
                Ok(event) => self.handle_event(event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Global status listener lagged");
                }
                Err(RecvError::Closed) => {
                    tracing::warn!(url = %self.url, "Global status upstream closed");
                    self.pool.unsubscribe(&self.url, SUBSCRIBER_ID);
                    return;
                }
            }
        }
    }

    fn handle_event(&self, event: StreamEvent) {
        match event {
            StreamEvent::Heartbeat => tracing::trace!("Global status heartbeat"),
            StreamEvent::TransportError(reason) => {
                tracing::warn!(reason = %reason, "Global status stream interrupted");
            }
            StreamEvent::Frame(frame) => {
                if frame.event != "message" || is_heartbeat(&frame.data) {
                    return;
                }
                match QueueStatus::decode(&frame.data) {
                    Ok(Some(status)) => {
                        self.latest.send_replace(Some(status));
                    }
                    Ok(None) => tracing::debug!("Ignoring non queue_status global frame"),
                    Err(e) => tracing::warn!(error = %e, "Malformed global status frame"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::sse::{SseFrame, HEARTBEAT_PREFIX};
    use crate::services::transport::LoopbackTransport;

    const URL: &str = "http://backend.test/api/queue/stream";

    fn setup(debounce: Duration) -> (Arc<LoopbackTransport>, Arc<ConnectionPool>, GlobalStatusBroadcaster) {
        let transport = Arc::new(LoopbackTransport::new());
        let pool = Arc::new(ConnectionPool::new(transport.clone()));
        let broadcaster = GlobalStatusBroadcaster::new(pool.clone(), URL.to_string(), debounce);
        (transport, pool, broadcaster)
    }

    fn message(data: &str) -> StreamEvent {
        StreamEvent::Frame(SseFrame {
            event: "message".to_string(),
            data: data.to_string(),
            id: None,
        })
    }

    #[tokio::test]
    async fn test_start_is_debounced_and_collapsed() {
        let (transport, pool, broadcaster) = setup(Duration::from_millis(30));
        broadcaster.start();
        broadcaster.start();
        broadcaster.start();
        assert_eq!(pool.get_stats().url_count, 0);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(transport.open_count(), 1);
        assert_eq!(pool.refcount(URL), 1);
    }

    #[tokio::test]
    async fn test_stop_before_debounce_never_connects() {
        let (transport, _pool, broadcaster) = setup(Duration::from_millis(30));
        broadcaster.start();
        broadcaster.stop();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(transport.open_count(), 0);
    }

    #[tokio::test]
    async fn test_queue_status_reaches_watchers_and_heartbeats_do_not() {
        let (transport, pool, broadcaster) = setup(Duration::from_millis(1));
        let mut watcher = broadcaster.subscribe();
        broadcaster.start();
        tokio::time::sleep(Duration::from_millis(20)).await;

        transport.emit(URL, StreamEvent::Heartbeat);
        transport.emit(URL, message(HEARTBEAT_PREFIX));
        transport.emit(
            URL,
            message(r#"{"type":"queue_status","queue":{"pending":3},"system":{"status":"ok"}}"#),
        );

        watcher.changed().await.unwrap();
        let status = watcher.borrow().clone().unwrap();
        assert_eq!(status.queue.pending, 3);
        assert_eq!(broadcaster.latest().unwrap().system.status, "ok");

        broadcaster.stop();
        assert_eq!(pool.get_stats().url_count, 0);
        assert_eq!(transport.close_count(), 1);
    }
}
