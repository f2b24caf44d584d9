//! Stream client for the check backend.
//!
//! `watch <check-id>...` follows checks until they finish, logging every
//! state change and the shared queue status. Ctrl-C cancels whatever is
//! still running. `watch regenerate [organization-id]` starts an embedding
//! regeneration job and polls it to the end.

use check_notify::config::ClientConfig;
use check_notify::models::check::CheckId;
use check_notify::services::backend::{BackendClient, Endpoints};
use check_notify::services::hub::NotificationHub;
use check_notify::services::transport::HttpTransport;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = ClientConfig::from_env().expect("Failed to load configuration");

    if let Some(addr) = &config.metrics_addr {
        install_metrics(addr);
    }
    let endpoints = Endpoints::new(&config.backend_url);
    let backend = BackendClient::new(endpoints.clone(), config.api_token.clone())
        .expect("Failed to initialize backend client");

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("regenerate") => {
            let organization_id = args.get(1).map(|raw| {
                raw.parse::<i64>()
                    .expect("Organization id must be an integer")
            });
            regenerate(&backend, &config, organization_id).await;
        }
        Some(_) => {
            let check_ids: Vec<CheckId> = args
                .iter()
                .map(|raw| raw.parse().expect("Check ids must be integers"))
                .collect();
            let transport = HttpTransport::new(config.api_token.clone())
                .expect("Failed to initialize stream transport");
            let hub = NotificationHub::new(
                Arc::new(transport),
                Arc::new(backend),
                endpoints,
                config.hub_settings(),
            );
            watch(&hub, check_ids).await;
        }
        None => {
            eprintln!("usage: watch <check-id>... | watch regenerate [organization-id]");
            std::process::exit(2);
        }
    }
}

/// Serve the pool and cancellation metrics on a scrape listener.
fn install_metrics(addr: &str) {
    let addr: SocketAddr = addr.parse().expect("METRICS_ADDR must be a socket address");
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("Failed to install Prometheus metrics listener");

    metrics::describe_counter!(
        "sse_upstream_opened_total",
        "Upstream event streams opened by the connection pool"
    );
    metrics::describe_counter!(
        "sse_upstream_closed_total",
        "Upstream event streams closed by the connection pool"
    );
    metrics::describe_gauge!("sse_pool_urls", "Stream URLs currently held open by the pool");
    metrics::describe_counter!("check_cancellations_total", "Checks cancelled by the client");
    tracing::info!(%addr, "Metrics listener started");
}

async fn watch(hub: &NotificationHub, check_ids: Vec<CheckId>) {
    let mut updates = hub.store().subscribe();
    let mut queue = hub.global().subscribe();
    let mut pending: HashSet<CheckId> = check_ids.iter().copied().collect();

    hub.start_global();
    for check_id in check_ids {
        hub.watch_check(check_id);
    }
    tracing::info!(checks = pending.len(), "Watching checks");

    while !pending.is_empty() {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(state) => {
                    tracing::info!(
                        check_id = state.id,
                        status = %state.status,
                        message = state.message.as_deref().unwrap_or(""),
                        degraded = state.degraded,
                        violations = state.violations.len(),
                        "Check updated"
                    );
                    if state.status.is_terminal() {
                        hub.release_check(state.id);
                        pending.remove(&state.id);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Dropped check updates");
                }
                Err(RecvError::Closed) => break,
            },
            Ok(()) = queue.changed() => {
                if let Some(status) = queue.borrow_and_update().clone() {
                    tracing::info!(
                        pending = status.queue.pending,
                        processing = status.queue.processing,
                        system = %status.system.status,
                        "Queue status"
                    );
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!(remaining = pending.len(), "Interrupted, cancelling checks");
                break;
            }
        }
    }

    for handle in hub.shutdown() {
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "Cancellation task did not finish");
        }
    }
}

async fn regenerate(backend: &BackendClient, config: &ClientConfig, organization_id: Option<i64>) {
    let job_id = match backend.start_regeneration(organization_id, None).await {
        Ok(job_id) => job_id,
        Err(e) => {
            tracing::error!(error = %e, "Failed to start embedding regeneration");
            std::process::exit(1);
        }
    };
    tracing::info!(job_id = %job_id, "Embedding regeneration started");

    match backend.wait_for_job(job_id, config.job_poll_interval()).await {
        Ok(progress) => tracing::info!(
            job_id = %job_id,
            status = %progress.status,
            completed = progress.completed,
            failed = progress.failed,
            total = progress.total,
            "Embedding regeneration finished"
        ),
        Err(e) => {
            tracing::error!(job_id = %job_id, error = %e, "Embedding job polling failed");
            std::process::exit(1);
        }
    }
}
