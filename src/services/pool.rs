//! Shared upstream connections keyed by stream URL.
//!
//! Many subscribers can want the same feed (several widgets watching the
//! global queue, a controller and a poller on the same check). The pool opens
//! one upstream per URL, tracks the subscribers sharing it and closes it when
//! the last one leaves.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;

use crate::services::transport::{StreamEvent, StreamTransport, UpstreamConnection};

struct PoolEntry {
    connection: Arc<dyn UpstreamConnection>,
    subscribers: HashSet<String>,
}

/// Handle to a pooled upstream. Cloning it does not add a subscriber.
#[derive(Clone)]
pub struct ConnectionHandle {
    connection: Arc<dyn UpstreamConnection>,
}

impl ConnectionHandle {
    pub fn url(&self) -> &str {
        self.connection.url()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.connection.subscribe()
    }

    /// Whether both handles share one upstream connection.
    pub fn same_connection(&self, other: &ConnectionHandle) -> bool {
        Arc::ptr_eq(&self.connection, &other.connection)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub url_count: usize,
    pub total_subscribers: usize,
}

/// Reference-counted pool of upstream stream connections.
///
/// Construct one per application and hand it to every consumer. All
/// check-and-update steps run under one lock that is never held across an
/// await, so concurrent subscribes to a URL cannot open two upstreams and a
/// decrement to zero closes the upstream exactly once.
pub struct ConnectionPool {
    transport: Arc<dyn StreamTransport>,
    entries: Mutex<HashMap<String, PoolEntry>>,
}

impl ConnectionPool {
    pub fn new(transport: Arc<dyn StreamTransport>) -> Self {
        Self {
            transport,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Join (or open) the upstream for `url`. Repeating the call with the
    /// same `subscriber_id` does not add a second reference.
    pub fn get_connection(&self, url: &str, subscriber_id: &str) -> ConnectionHandle {
        let mut entries = self.entries();
        let entry = entries.entry(url.to_string()).or_insert_with(|| {
            tracing::info!(url = %url, "Opening upstream event stream");
            metrics::counter!("sse_upstream_opened_total").increment(1);
            PoolEntry {
                connection: self.transport.open(url),
                subscribers: HashSet::new(),
            }
        });

        if entry.subscribers.insert(subscriber_id.to_string()) {
            tracing::debug!(
                url = %url,
                subscriber = %subscriber_id,
                refcount = entry.subscribers.len(),
                "Subscriber joined upstream"
            );
        }
        let handle = ConnectionHandle {
            connection: Arc::clone(&entry.connection),
        };
        metrics::gauge!("sse_pool_urls").set(entries.len() as f64);
        handle
    }

    /// Drop `subscriber_id` from `url`, closing the upstream when it was the
    /// last subscriber. Returns `false` if the pair was not subscribed.
    pub fn unsubscribe(&self, url: &str, subscriber_id: &str) -> bool {
        let closing = {
            let mut entries = self.entries();
            let Some(entry) = entries.get_mut(url) else {
                return false;
            };
            if !entry.subscribers.remove(subscriber_id) {
                return false;
            }
            tracing::debug!(
                url = %url,
                subscriber = %subscriber_id,
                refcount = entry.subscribers.len(),
                "Subscriber left upstream"
            );
            let closing = if entry.subscribers.is_empty() {
                entries.remove(url).map(|e| e.connection)
            } else {
                None
            };
            metrics::gauge!("sse_pool_urls").set(entries.len() as f64);
            closing
        };

        if let Some(connection) = closing {
            close_quietly(url, connection.as_ref());
        }
        true
    }

    /// Current subscriber count for `url`; zero when no entry exists.
    pub fn refcount(&self, url: &str) -> usize {
        self.entries()
            .get(url)
            .map(|e| e.subscribers.len())
            .unwrap_or(0)
    }

    pub fn get_stats(&self) -> PoolStats {
        let entries = self.entries();
        PoolStats {
            url_count: entries.len(),
            total_subscribers: entries.values().map(|e| e.subscribers.len()).sum(),
        }
    }

    /// Close every upstream and forget all subscribers.
    pub fn close_all(&self) {
        let drained: Vec<(String, PoolEntry)> = self.entries().drain().collect();
        metrics::gauge!("sse_pool_urls").set(0.0);
        for (url, entry) in drained {
            close_quietly(&url, entry.connection.as_ref());
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, PoolEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Connection pool mutex poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

/// Cleanup is best-effort: a failing close is logged and never propagated.
fn close_quietly(url: &str, connection: &dyn UpstreamConnection) {
    match connection.close() {
        Ok(()) => {
            metrics::counter!("sse_upstream_closed_total").increment(1);
            tracing::info!(url = %url, "Closed upstream event stream");
        }
        Err(e) => tracing::warn!(url = %url, error = %e, "Failed to close upstream event stream"),
    }
}
