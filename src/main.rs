use axum::routing::get;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use check_notify::app_state::AppState;
use check_notify::config::AppConfig;
use check_notify::db::{self, dictionary::PgDictionaryRepository};
use check_notify::routes;
use check_notify::services::embedding::WorkersAiEmbedder;
use check_notify::services::embedding_queue::EmbeddingJobQueue;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing check-notify job server");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    metrics::describe_counter!(
        "embedding_jobs_total",
        "Total embedding regeneration jobs started"
    );
    metrics::describe_counter!(
        "embedding_items_processed_total",
        "Dictionary phrases whose embedding was regenerated"
    );
    metrics::describe_counter!(
        "embedding_items_failed_total",
        "Dictionary phrases whose embedding could not be regenerated"
    );

    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");
    let repository = Arc::new(PgDictionaryRepository::new(db_pool));

    tracing::info!(model = %config.embedding_model, "Initializing Workers AI embedder");
    let embedder = WorkersAiEmbedder::new(
        &config.cf_account_id,
        &config.cf_api_token,
        &config.embedding_model,
    );

    let jobs = EmbeddingJobQueue::new(
        Arc::new(embedder),
        repository.clone(),
        config.job_retention(),
        config.failure_policy(),
    );
    let state = AppState::new(repository, jobs);

    let app = routes::api_router(state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(1024 * 1024));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app).await.expect("Server error");
}
