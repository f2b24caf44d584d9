use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use garde::Validate;
use serde::Deserialize;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::job::{EnqueuedResponse, JobProgress, LegacyRegenerateResponse, RegenerateRequest};
use crate::routes::ApiError;

#[derive(Debug, Deserialize)]
pub struct JobQuery {
    #[serde(rename = "jobId")]
    pub job_id: Uuid,
}

/// POST /api/v1/embeddings/regenerate
///
/// Starts a regeneration job and answers 202 with its id. With `wait: true`
/// the job runs inline and the legacy completion payload is returned.
pub async fn regenerate(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request = parse_request(&body)?;

    let items = match request.items {
        Some(items) => {
            for item in &items {
                item.validate()
                    .map_err(|e| ApiError::BadRequest(format!("Invalid item {}: {e}", item.id)))?;
            }
            items
        }
        None => state.repository.list_phrases(request.organization_id).await?,
    };

    if request.wait {
        let progress = state
            .jobs
            .run_to_completion(request.organization_id, items)
            .await;
        return Ok(Json(LegacyRegenerateResponse::from(&progress)).into_response());
    }

    let job_id = state.jobs.enqueue(request.organization_id, items);
    Ok((StatusCode::ACCEPTED, Json(EnqueuedResponse { job_id })).into_response())
}

/// GET /api/v1/embeddings/regenerate?jobId=<uuid>
pub async fn get_job_status(
    State(state): State<AppState>,
    Query(query): Query<JobQuery>,
) -> Result<Json<JobProgress>, ApiError> {
    state
        .jobs
        .get_job(query.job_id)
        .map(Json)
        .ok_or(ApiError::JobNotFound)
}

// An empty body is the same as `{}`.
fn parse_request(body: &[u8]) -> Result<RegenerateRequest, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(RegenerateRequest::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("Invalid request body: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_body_parses_as_defaults() {
        let request = parse_request(b"  \n").unwrap();
        assert!(request.organization_id.is_none());
        assert!(request.items.is_none());
        assert!(!request.wait);
    }

    #[test]
    fn body_fields_are_optional() {
        let request = parse_request(br#"{"wait": true}"#).unwrap();
        assert!(request.wait);
        assert!(request.items.is_none());

        let request =
            parse_request(br#"{"organization_id": 4, "items": [{"id": 1, "phrase": "free"}]}"#)
                .unwrap();
        assert_eq!(request.organization_id, Some(4));
        assert_eq!(request.items.map(|items| items.len()), Some(1));
    }

    #[test]
    fn malformed_body_is_bad_request() {
        assert!(matches!(
            parse_request(b"{not json"),
            Err(ApiError::BadRequest(_))
        ));
    }
}
