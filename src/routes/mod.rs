pub mod embeddings;
pub mod health;
pub mod metrics;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use crate::app_state::AppState;

/// Errors returned by the HTTP handlers as `{"error": "..."}` bodies.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Job not found")]
    JobNotFound,

    #[error("{0}")]
    BadRequest(String),

    #[error("Dictionary lookup failed: {0}")]
    Repository(#[from] sqlx::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::JobNotFound => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Repository(e) => {
                tracing::error!(error = %e, "Repository error while serving request");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Health and embedding job routes. `/metrics` is mounted separately since it
/// carries its own state.
pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route(
            "/api/v1/embeddings/regenerate",
            get(embeddings::get_job_status).post(embeddings::regenerate),
        )
        .with_state(state)
}
