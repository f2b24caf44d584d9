use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::models::check::CheckId;
use crate::services::backend::{CheckBackend, Endpoints};
use crate::services::cancellation::CancellationCoordinator;
use crate::services::check_stream::{CheckStore, CheckStreamController};
use crate::services::global_status::GlobalStatusBroadcaster;
use crate::services::pool::ConnectionPool;
use crate::services::transport::StreamTransport;

#[derive(Debug, Clone, Copy)]
pub struct HubSettings {
    pub global_debounce: Duration,
    pub idle_timeout: Duration,
    /// Interval of the fallback status poll; `None` disables polling.
    pub fallback_poll_interval: Option<Duration>,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            global_debounce: Duration::from_millis(300),
            idle_timeout: Duration::from_secs(45),
            fallback_poll_interval: Some(Duration::from_millis(1500)),
        }
    }
}

/// Owns the notification stack for one client session: the connection pool,
/// the per-check controller, the global status stream and the coordinator.
pub struct NotificationHub {
    pool: Arc<ConnectionPool>,
    store: Arc<CheckStore>,
    controller: CheckStreamController,
    global: GlobalStatusBroadcaster,
    coordinator: CancellationCoordinator,
    settings: HubSettings,
}

impl NotificationHub {
    pub fn new(
        transport: Arc<dyn StreamTransport>,
        backend: Arc<dyn CheckBackend>,
        endpoints: Endpoints,
        settings: HubSettings,
    ) -> Self {
        let pool = Arc::new(ConnectionPool::new(transport));
        let store = Arc::new(CheckStore::new());
        let controller = CheckStreamController::new(
            Arc::clone(&pool),
            store.clone(),
            endpoints.clone(),
            settings.idle_timeout,
        );
        let global = GlobalStatusBroadcaster::new(
            Arc::clone(&pool),
            endpoints.global_stream_url(),
            settings.global_debounce,
        );
        let coordinator = CancellationCoordinator::new(controller.clone(), store.clone(), backend);

        Self {
            pool,
            store,
            controller,
            global,
            coordinator,
            settings,
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn store(&self) -> &Arc<CheckStore> {
        &self.store
    }

    pub fn controller(&self) -> &CheckStreamController {
        &self.controller
    }

    pub fn global(&self) -> &GlobalStatusBroadcaster {
        &self.global
    }

    pub fn start_global(&self) {
        self.global.start();
    }

    /// Stream `check_id` and, when configured, poll it in parallel.
    pub fn watch_check(&self, check_id: CheckId) {
        self.coordinator.track(check_id);
        if let Some(interval) = self.settings.fallback_poll_interval {
            self.coordinator.spawn_status_poll(check_id, interval);
        }
    }

    /// Drop the bookkeeping of a check that reached a terminal state, so
    /// shutdown does not try to cancel it.
    pub fn release_check(&self, check_id: CheckId) -> bool {
        self.coordinator.release(check_id)
    }

    pub fn is_tracked(&self, check_id: CheckId) -> bool {
        self.coordinator.is_tracked(check_id)
    }

    pub fn cancel_check(&self, check_id: CheckId) -> Option<JoinHandle<()>> {
        self.coordinator.cancel(check_id)
    }

    /// Stop the global stream, cancel every tracked check and close any
    /// upstream still open. Returns the pending server notifications.
    pub fn shutdown(&self) -> Vec<JoinHandle<()>> {
        self.global.stop();
        let pending = self.coordinator.teardown();
        self.pool.close_all();
        tracing::info!(pending_cancels = pending.len(), "Notification hub shut down");
        pending
    }
}
