//! Per-check stream sessions.
//!
//! Each started check gets one listener task that consumes its upstream in
//! arrival order and turns `progress` / `complete` / `error` frames into
//! [`CheckUpdate`]s. Transport trouble never fails a check: it only surfaces
//! a fallback notice while the polling path keeps working.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use crate::models::check::{CheckId, CheckState, CheckUpdate, OcrStatus};
use crate::models::events::{CheckEvent, CompletePayload, ProgressPayload};
use crate::services::backend::Endpoints;
use crate::services::pool::ConnectionPool;
use crate::services::transport::StreamEvent;

pub const FALLBACK_MESSAGE: &str = "Live updates interrupted, falling back to polling";

/// Receives every state change the controller derives from a stream.
pub trait CheckStateSink: Send + Sync {
    fn apply(&self, check_id: CheckId, update: CheckUpdate);
}

/// In-memory check states with a change feed.
pub struct CheckStore {
    checks: RwLock<HashMap<CheckId, CheckState>>,
    updates: broadcast::Sender<CheckState>,
}

impl CheckStore {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(256);
        Self {
            checks: RwLock::new(HashMap::new()),
            updates,
        }
    }

    pub fn get(&self, check_id: CheckId) -> Option<CheckState> {
        match self.checks.read() {
            Ok(checks) => checks.get(&check_id).cloned(),
            Err(e) => {
                tracing::error!("RwLock poisoned reading check states: {e}");
                None
            }
        }
    }

    /// Snapshots of every state change that was accepted.
    pub fn subscribe(&self) -> broadcast::Receiver<CheckState> {
        self.updates.subscribe()
    }
}

impl Default for CheckStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CheckStateSink for CheckStore {
    fn apply(&self, check_id: CheckId, update: CheckUpdate) {
        let snapshot = match self.checks.write() {
            Ok(mut checks) => {
                let state = checks
                    .entry(check_id)
                    .or_insert_with(|| CheckState::new(check_id));
                if !state.apply(update) {
                    tracing::debug!(
                        check_id,
                        status = %state.status,
                        "Ignoring update for check in terminal state"
                    );
                    return;
                }
                state.clone()
            }
            Err(e) => {
                tracing::error!("RwLock poisoned writing check state: {e}");
                return;
            }
        };
        let _ = self.updates.send(snapshot);
    }
}

/// Build the processing update for a `progress` frame. The OCR phase and
/// the analysis phase get different messages.
pub fn progress_update(payload: &ProgressPayload) -> CheckUpdate {
    let ocr_status = payload
        .ocr_status
        .as_deref()
        .and_then(|s| s.parse::<OcrStatus>().ok());
    let message = match ocr_status {
        Some(OcrStatus::Pending | OcrStatus::Processing) => "Extracting text from image...",
        _ => "Analyzing text for violations...",
    };
    CheckUpdate::Progress {
        ocr_status,
        message: message.to_string(),
    }
}

/// Build the completed update for a `complete` frame, normalizing violations.
pub fn completed_update(payload: CompletePayload) -> CheckUpdate {
    let text_len = payload.original_text.chars().count();
    CheckUpdate::Completed {
        violations: payload
            .violations
            .into_iter()
            .map(|v| v.normalize(text_len))
            .collect(),
        original_text: payload.original_text,
        modified_text: payload.modified_text,
    }
}

fn subscriber_id(check_id: CheckId) -> String {
    format!("check-{check_id}")
}

struct Listener {
    generation: u64,
    url: String,
    task: JoinHandle<()>,
}

struct ControllerInner {
    pool: Arc<ConnectionPool>,
    sink: Arc<dyn CheckStateSink>,
    endpoints: Endpoints,
    idle_timeout: Duration,
    listeners: Mutex<HashMap<CheckId, Listener>>,
    generations: AtomicU64,
}

/// Starts, stops and drives per-check stream listeners.
#[derive(Clone)]
pub struct CheckStreamController {
    inner: Arc<ControllerInner>,
}

impl CheckStreamController {
    pub fn new(
        pool: Arc<ConnectionPool>,
        sink: Arc<dyn CheckStateSink>,
        endpoints: Endpoints,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                pool,
                sink,
                endpoints,
                idle_timeout,
                listeners: Mutex::new(HashMap::new()),
                generations: AtomicU64::new(1),
            }),
        }
    }

    /// Begin listening to `check_id`. A listener already running for the
    /// check is removed first, so at most one listener exists per check.
    pub fn start(&self, check_id: CheckId) {
        let url = self.inner.endpoints.check_stream_url(check_id);
        let mut listeners = self.inner.listeners();
        if let Some(previous) = listeners.remove(&check_id) {
            tracing::debug!(check_id, "Replacing existing stream listener");
            previous.task.abort();
        }

        let handle = self
            .inner
            .pool
            .get_connection(&url, &subscriber_id(check_id));
        let rx = handle.subscribe();
        let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed);
        let task = tokio::spawn(listen(Arc::clone(&self.inner), check_id, generation, rx));
        listeners.insert(
            check_id,
            Listener {
                generation,
                url,
                task,
            },
        );
        tracing::info!(check_id, "Started check stream");
    }

    /// Stop listening and release the pooled subscription.
    /// Returns `false` when no listener was running.
    pub fn stop(&self, check_id: CheckId) -> bool {
        // The pool is left while the listeners lock is held, so a concurrent
        // start for the same check cannot rejoin in between.
        let mut listeners = self.inner.listeners();
        match listeners.remove(&check_id) {
            Some(listener) => {
                listener.task.abort();
                self.inner
                    .pool
                    .unsubscribe(&listener.url, &subscriber_id(check_id));
                tracing::info!(check_id, "Stopped check stream");
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, check_id: CheckId) -> bool {
        self.inner.listeners().contains_key(&check_id)
    }

    pub fn active_checks(&self) -> Vec<CheckId> {
        self.inner.listeners().keys().copied().collect()
    }
}

impl ControllerInner {
    fn listeners(&self) -> MutexGuard<'_, HashMap<CheckId, Listener>> {
        self.listeners.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Stream listener mutex poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn is_current(&self, check_id: CheckId, generation: u64) -> bool {
        self.listeners()
            .get(&check_id)
            .is_some_and(|l| l.generation == generation)
    }

    /// Remove the listener entry if it still belongs to `generation` and
    /// give the subscription back to the pool.
    fn release(&self, check_id: CheckId, generation: u64) {
        let mut listeners = self.listeners();
        if !listeners
            .get(&check_id)
            .is_some_and(|l| l.generation == generation)
        {
            return;
        }
        if let Some(listener) = listeners.remove(&check_id) {
            self.pool
                .unsubscribe(&listener.url, &subscriber_id(check_id));
            tracing::debug!(check_id, "Released check stream subscription");
        }
    }

    fn degrade(&self, check_id: CheckId) {
        self.sink.apply(
            check_id,
            CheckUpdate::Degraded {
                message: FALLBACK_MESSAGE.to_string(),
            },
        );
    }

    fn handle_event(&self, check_id: CheckId, event: StreamEvent) -> ControlFlow<()> {
        match event {
            StreamEvent::Heartbeat => ControlFlow::Continue(()),
            StreamEvent::TransportError(reason) => {
                tracing::warn!(check_id, reason = %reason, "Check stream transport error");
                self.degrade(check_id);
                ControlFlow::Continue(())
            }
            StreamEvent::Frame(frame) => match CheckEvent::decode(&frame) {
                Ok(Some(event)) => self.apply_event(check_id, event),
                Ok(None) => {
                    tracing::debug!(check_id, event = %frame.event, "Ignoring unrecognised check event");
                    ControlFlow::Continue(())
                }
                Err(e) => {
                    tracing::warn!(
                        check_id,
                        event = %frame.event,
                        error = %e,
                        "Malformed check event data"
                    );
                    self.degrade(check_id);
                    ControlFlow::Continue(())
                }
            },
        }
    }

    fn apply_event(&self, check_id: CheckId, event: CheckEvent) -> ControlFlow<()> {
        match event {
            CheckEvent::Progress(payload) => {
                self.sink.apply(check_id, progress_update(&payload));
                ControlFlow::Continue(())
            }
            CheckEvent::Complete(payload) => {
                tracing::info!(
                    check_id,
                    violations = payload.violations.len(),
                    "Check completed"
                );
                self.sink.apply(check_id, completed_update(payload));
                ControlFlow::Break(())
            }
            CheckEvent::Error(payload) => {
                tracing::warn!(check_id, error = %payload.error, "Check failed");
                self.sink.apply(
                    check_id,
                    CheckUpdate::Failed {
                        message: format!("Check failed: {}", payload.error),
                    },
                );
                ControlFlow::Break(())
            }
        }
    }
}

async fn listen(
    inner: Arc<ControllerInner>,
    check_id: CheckId,
    generation: u64,
    mut rx: broadcast::Receiver<StreamEvent>,
) {
    let mut idle_notified = false;
    loop {
        let received = tokio::time::timeout(inner.idle_timeout, rx.recv()).await;
        if !inner.is_current(check_id, generation) {
            return;
        }

        let event = match received {
            Err(_) => {
                if !idle_notified {
                    tracing::warn!(
                        check_id,
                        idle_secs = inner.idle_timeout.as_secs_f64(),
                        "No stream activity, falling back to polling"
                    );
                    inner.degrade(check_id);
                    idle_notified = true;
                }
                continue;
            }
            Ok(Err(RecvError::Lagged(skipped))) => {
                tracing::warn!(check_id, skipped, "Check stream listener lagged");
                continue;
            }
            Ok(Err(RecvError::Closed)) => {
                tracing::warn!(check_id, "Upstream closed before a terminal event");
                inner.degrade(check_id);
                break;
            }
            Ok(Ok(event)) => event,
        };

        idle_notified = false;
        if inner.handle_event(check_id, event).is_break() {
            break;
        }
    }
    inner.release(check_id, generation);
}
