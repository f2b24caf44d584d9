//! Teardown of everything attached to one check.
//!
//! Cancelling has two independent steps. Local effects (timers aborted,
//! stream released, state flipped to `cancelled`) happen synchronously
//! before `cancel` returns. The server notification runs on a detached task
//! whose failure is only logged.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::{AbortHandle, JoinHandle};

use crate::models::check::{Check, CheckId, CheckStatus, CheckUpdate};
use crate::services::backend::CheckBackend;
use crate::services::check_stream::{CheckStateSink, CheckStreamController};
use crate::services::polling::{poll_until_terminal, PollError};

/// Auxiliary handles owned by one tracked check.
#[derive(Default)]
struct TrackedCheck {
    timers: Vec<AbortHandle>,
}

impl TrackedCheck {
    fn abort_timers(self) {
        for timer in self.timers {
            timer.abort();
        }
    }
}

type Tracked = Arc<Mutex<HashMap<CheckId, TrackedCheck>>>;

fn lock(tracked: &Tracked) -> MutexGuard<'_, HashMap<CheckId, TrackedCheck>> {
    tracked.lock().unwrap_or_else(|poisoned| {
        tracing::error!("Cancellation mutex poisoned, recovering");
        poisoned.into_inner()
    })
}

pub struct CancellationCoordinator {
    controller: CheckStreamController,
    sink: Arc<dyn CheckStateSink>,
    backend: Arc<dyn CheckBackend>,
    tracked: Tracked,
}

impl CancellationCoordinator {
    pub fn new(
        controller: CheckStreamController,
        sink: Arc<dyn CheckStateSink>,
        backend: Arc<dyn CheckBackend>,
    ) -> Self {
        Self {
            controller,
            sink,
            backend,
            tracked: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register `check_id` and start its stream. A check has at most one
    /// entry; tracking it again only restarts the stream.
    pub fn track(&self, check_id: CheckId) {
        lock(&self.tracked).entry(check_id).or_default();
        self.controller.start(check_id);
    }

    /// Hand a timer or poll task to the check's entry so cancel can abort it.
    /// Untracked checks get the handle aborted straight away.
    pub fn attach_timer(&self, check_id: CheckId, timer: AbortHandle) -> bool {
        match lock(&self.tracked).get_mut(&check_id) {
            Some(entry) => {
                entry.timers.push(timer);
                true
            }
            None => {
                timer.abort();
                false
            }
        }
    }

    /// Poll the backend for `check_id` until it reaches a terminal state,
    /// then apply that state and drop the entry. This keeps a check moving
    /// when its live stream degrades.
    pub fn spawn_status_poll(&self, check_id: CheckId, interval: Duration) -> bool {
        if !self.is_tracked(check_id) {
            return false;
        }
        let backend = Arc::clone(&self.backend);
        let sink = Arc::clone(&self.sink);
        let controller = self.controller.clone();
        let tracked = Arc::clone(&self.tracked);

        let task = tokio::spawn(async move {
            let Some(check) = poll_check(backend.as_ref(), check_id, interval).await else {
                return;
            };
            tracing::info!(check_id, status = %check.status, "Polling observed terminal check");
            sink.apply(check_id, terminal_update(&check));
            controller.stop(check_id);
            let entry = lock(&tracked).remove(&check_id);
            if let Some(entry) = entry {
                entry.abort_timers();
            }
        });
        self.attach_timer(check_id, task.abort_handle())
    }

    pub fn is_tracked(&self, check_id: CheckId) -> bool {
        lock(&self.tracked).contains_key(&check_id)
    }

    pub fn tracked_checks(&self) -> Vec<CheckId> {
        lock(&self.tracked).keys().copied().collect()
    }

    /// Forget a check that finished on its own: timers are aborted and the
    /// stream released, the check state is left alone.
    pub fn release(&self, check_id: CheckId) -> bool {
        let entry = lock(&self.tracked).remove(&check_id);
        self.controller.stop(check_id);
        match entry {
            Some(entry) => {
                entry.abort_timers();
                tracing::debug!(check_id, "Released finished check");
                true
            }
            None => false,
        }
    }

    /// Synchronous half of cancellation. Always leaves the check locally
    /// `cancelled` (unless it already finished). Returns whether an entry existed.
    pub fn cancel_local(&self, check_id: CheckId) -> bool {
        let entry = lock(&self.tracked).remove(&check_id);
        let had_entry = entry.is_some();
        if let Some(entry) = entry {
            entry.abort_timers();
        }
        self.controller.stop(check_id);
        self.sink.apply(check_id, CheckUpdate::Cancelled);
        metrics::counter!("check_cancellations_total").increment(1);
        tracing::info!(check_id, had_entry, "Check cancelled locally");
        had_entry
    }

    /// Cancel `check_id`. When the check was tracked the server is notified
    /// on a detached task, returned so callers may await it.
    pub fn cancel(&self, check_id: CheckId) -> Option<JoinHandle<()>> {
        if !self.cancel_local(check_id) {
            tracing::debug!(check_id, "No tracked controller, skipping server cancel");
            return None;
        }
        let backend = Arc::clone(&self.backend);
        Some(tokio::spawn(async move {
            match backend.cancel_check(check_id).await {
                Ok(()) => tracing::info!(check_id, "Server acknowledged cancellation"),
                Err(e) => tracing::warn!(check_id, error = %e, "Server-side cancellation failed"),
            }
        }))
    }

    /// Cancel every tracked check. Used when the owner goes away.
    pub fn teardown(&self) -> Vec<JoinHandle<()>> {
        let checks = self.tracked_checks();
        tracing::info!(count = checks.len(), "Tearing down tracked checks");
        checks
            .into_iter()
            .filter_map(|check_id| self.cancel(check_id))
            .collect()
    }
}

async fn poll_check(backend: &dyn CheckBackend, check_id: CheckId, interval: Duration) -> Option<Check> {
    loop {
        let result = poll_until_terminal(interval, None, || backend.fetch_check(check_id)).await;
        match result {
            Ok(check) => return Some(check),
            Err(PollError::NotFound) => {
                tracing::warn!(check_id, "Check not found while polling");
                return None;
            }
            Err(PollError::Source(e)) => {
                tracing::warn!(check_id, error = %e, "Check status poll failed, retrying");
            }
            Err(PollError::TimedOut(_)) => {}
        }
        tokio::time::sleep(interval).await;
    }
}

fn terminal_update(check: &Check) -> CheckUpdate {
    match check.status {
        CheckStatus::Completed => CheckUpdate::Completed {
            original_text: check.original_text.clone(),
            modified_text: check.modified_text.clone(),
            violations: check.normalized_violations(),
        },
        CheckStatus::Cancelled => CheckUpdate::Cancelled,
        _ => CheckUpdate::Failed {
            message: "Check failed during processing".to_string(),
        },
    }
}
