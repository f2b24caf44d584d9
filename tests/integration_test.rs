//! Notification hub driven end to end over the loopback transport.
//!
//! Run with: cargo test --test integration_test

mod fixtures;
mod helpers;

use check_notify::models::check::CheckStatus;
use check_notify::services::backend::Endpoints;
use check_notify::services::hub::{HubSettings, NotificationHub};
use check_notify::services::transport::{LoopbackTransport, StreamEvent};
use fixtures::*;
use helpers::*;
use std::sync::Arc;
use std::time::Duration;

struct Setup {
    transport: Arc<LoopbackTransport>,
    backend: Arc<RecordingBackend>,
    endpoints: Endpoints,
    hub: NotificationHub,
}

fn setup(backend: RecordingBackend) -> Setup {
    let transport = Arc::new(LoopbackTransport::new());
    let backend = Arc::new(backend);
    let endpoints = Endpoints::new(BACKEND_URL);
    let settings = HubSettings {
        global_debounce: Duration::from_millis(10),
        idle_timeout: Duration::from_secs(5),
        fallback_poll_interval: None,
    };
    let hub = NotificationHub::new(
        transport.clone(),
        backend.clone(),
        endpoints.clone(),
        settings,
    );
    Setup {
        transport,
        backend,
        endpoints,
        hub,
    }
}

fn status_of(s: &Setup, check_id: i64) -> Option<CheckStatus> {
    s.hub.store().get(check_id).map(|state| state.status)
}

#[tokio::test]
async fn test_check_completes_with_repaired_violations() {
    let s = setup(RecordingBackend::default());
    let url = s.endpoints.check_stream_url(1);
    s.hub.watch_check(1);
    assert!(s.transport.is_open(&url));

    s.transport.emit(&url, progress_ocr());
    assert!(eventually(|| status_of(&s, 1) == Some(CheckStatus::Processing)).await);
    assert_eq!(
        s.hub.store().get(1).unwrap().message.as_deref(),
        Some("Extracting text from image...")
    );

    s.transport.emit(&url, progress_analysis());
    s.transport.emit(&url, complete(1));
    assert!(eventually(|| status_of(&s, 1) == Some(CheckStatus::Completed)).await);

    let state = s.hub.store().get(1).unwrap();
    assert_eq!(state.violations.len(), 2);
    assert_eq!(state.violations[0].dictionary_id, Some(12));
    assert_eq!(state.violations[1].dictionary_id, None);
    for violation in &state.violations {
        assert!(violation.start <= violation.end);
        assert!(violation.end <= "Buy now, cure all".len());
    }

    // The completed stream is handed back to the pool.
    assert!(eventually(|| !s.transport.is_open(&url)).await);
    assert!(s.hub.release_check(1));
    assert!(s.hub.shutdown().is_empty());
    assert!(s.backend.cancelled().is_empty());
}

#[tokio::test]
async fn test_error_frame_fails_check() {
    let s = setup(RecordingBackend::default());
    let url = s.endpoints.check_stream_url(2);
    s.hub.watch_check(2);

    s.transport.emit(&url, progress_analysis());
    s.transport.emit(&url, error("organization quota exceeded"));
    assert!(eventually(|| status_of(&s, 2) == Some(CheckStatus::Failed)).await);

    let message = s.hub.store().get(2).unwrap().message.unwrap();
    assert!(message.contains("organization quota exceeded"));
    assert!(eventually(|| !s.transport.is_open(&url)).await);
}

#[tokio::test]
async fn test_transport_error_degrades_without_failing() {
    let s = setup(RecordingBackend::default());
    let url = s.endpoints.check_stream_url(3);
    s.hub.watch_check(3);

    s.transport.emit(&url, StreamEvent::TransportError("connection reset".to_string()));
    assert!(eventually(|| s.hub.store().get(3).is_some_and(|state| state.degraded)).await);
    assert_ne!(status_of(&s, 3), Some(CheckStatus::Failed));

    s.transport.emit(&url, complete(3));
    assert!(eventually(|| status_of(&s, 3) == Some(CheckStatus::Completed)).await);
}

#[tokio::test]
async fn test_global_stream_is_shared_between_widgets() {
    let s = setup(RecordingBackend::default());
    let url = s.endpoints.global_stream_url();

    s.hub.start_global();
    s.hub.start_global();
    let dashboard = s.hub.pool().get_connection(&url, "dashboard");
    let sidebar = s.hub.pool().get_connection(&url, "sidebar");
    let _ = s.hub.pool().get_connection(&url, "sidebar");
    assert!(dashboard.same_connection(&sidebar));

    assert!(eventually(|| s.hub.pool().refcount(&url) == 3).await);
    assert_eq!(s.transport.open_count(), 1);

    s.transport.emit(&url, heartbeat());
    s.transport.emit(&url, queue_status(5, 2));
    assert!(eventually(|| s.hub.global().latest().is_some()).await);
    let status = s.hub.global().latest().unwrap();
    assert_eq!(status.queue.pending, 5);
    assert_eq!(status.organization.unwrap().checks_limit, 100);

    s.hub.pool().unsubscribe(&url, "dashboard");
    s.hub.pool().unsubscribe(&url, "sidebar");
    assert!(s.transport.is_open(&url));
    s.hub.global().stop();
    assert!(!s.transport.is_open(&url));
    assert_eq!(s.transport.close_count(), 1);
}

#[tokio::test]
async fn test_cancel_is_immediate_and_notifies_server() {
    let s = setup(RecordingBackend::default());
    let url = s.endpoints.check_stream_url(11);
    s.hub.watch_check(11);
    s.transport.emit(&url, progress_ocr());
    assert!(eventually(|| status_of(&s, 11) == Some(CheckStatus::Processing)).await);

    let remote = s.hub.cancel_check(11).expect("tracked check notifies server");
    assert_eq!(status_of(&s, 11), Some(CheckStatus::Cancelled));
    assert!(!s.transport.is_open(&url));
    assert!(!s.hub.is_tracked(11));

    remote.await.unwrap();
    assert_eq!(s.backend.cancelled(), vec![11]);

    // Late frames find nobody listening.
    assert_eq!(s.transport.emit(&url, complete(11)), 0);
    assert_eq!(status_of(&s, 11), Some(CheckStatus::Cancelled));
}

#[tokio::test]
async fn test_failed_server_cancel_keeps_local_state() {
    let s = setup(RecordingBackend {
        fail_cancel: true,
        ..Default::default()
    });
    s.hub.watch_check(12);
    s.hub.cancel_check(12).unwrap().await.unwrap();

    assert_eq!(status_of(&s, 12), Some(CheckStatus::Cancelled));
    assert_eq!(s.backend.cancelled(), vec![12]);
}

#[tokio::test]
async fn test_cancel_of_unknown_check_stays_local() {
    let s = setup(RecordingBackend::default());
    assert!(s.hub.cancel_check(99).is_none());
    assert_eq!(status_of(&s, 99), Some(CheckStatus::Cancelled));
    assert!(s.backend.cancelled().is_empty());
}

#[tokio::test]
async fn test_shutdown_leaves_no_subscription_behind() {
    let s = setup(RecordingBackend::default());
    let global_url = s.endpoints.global_stream_url();
    s.hub.start_global();
    s.hub.watch_check(21);
    s.hub.watch_check(22);
    assert!(eventually(|| s.transport.is_open(&global_url)).await);

    let pending = s.hub.shutdown();
    assert_eq!(pending.len(), 2);
    for handle in pending {
        handle.await.unwrap();
    }

    let stats = s.hub.pool().get_stats();
    assert_eq!(stats.url_count, 0);
    assert_eq!(stats.total_subscribers, 0);
    assert!(!s.transport.is_open(&global_url));
    assert_eq!(status_of(&s, 21), Some(CheckStatus::Cancelled));
    assert_eq!(status_of(&s, 22), Some(CheckStatus::Cancelled));

    let mut cancelled = s.backend.cancelled();
    cancelled.sort();
    assert_eq!(cancelled, vec![21, 22]);
}

#[tokio::test]
async fn test_close_failures_do_not_block_shutdown() {
    let s = setup(RecordingBackend::default());
    s.transport.fail_on_close(true);
    s.hub.watch_check(31);

    for handle in s.hub.shutdown() {
        handle.await.unwrap();
    }
    assert_eq!(s.hub.pool().get_stats().url_count, 0);
    assert_eq!(status_of(&s, 31), Some(CheckStatus::Cancelled));
}
