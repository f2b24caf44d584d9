use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use uuid::Uuid;

use crate::models::check::{Check, CheckId};
use crate::models::job::{EmbeddingItem, EnqueuedResponse, JobProgress};
use crate::services::polling::{poll_until_terminal, PollError};

/// URL layout of the hosted backend.
#[derive(Debug, Clone)]
pub struct Endpoints {
    base_url: String,
}

impl Endpoints {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn check_stream_url(&self, check_id: CheckId) -> String {
        format!("{}/api/checks/{}/stream", self.base_url, check_id)
    }

    pub fn global_stream_url(&self) -> String {
        format!("{}/api/queue/stream", self.base_url)
    }

    pub fn check_url(&self, check_id: CheckId) -> String {
        format!("{}/api/checks/{}", self.base_url, check_id)
    }

    pub fn cancel_url(&self, check_id: CheckId) -> String {
        format!("{}/api/checks/{}/cancel", self.base_url, check_id)
    }

    pub fn regenerate_url(&self) -> String {
        format!("{}/api/v1/embeddings/regenerate", self.base_url)
    }
}

/// Check operations the notification layer needs from the backend.
#[async_trait]
pub trait CheckBackend: Send + Sync {
    /// Ask the server to stop processing a check.
    async fn cancel_check(&self, check_id: CheckId) -> Result<(), BackendError>;

    /// Current server-side record, `None` when the check does not exist.
    async fn fetch_check(&self, check_id: CheckId) -> Result<Option<Check>, BackendError>;
}

/// reqwest client for the hosted backend.
pub struct BackendClient {
    http: Client,
    endpoints: Endpoints,
    api_token: Option<String>,
}

impl BackendClient {
    pub fn new(endpoints: Endpoints, api_token: Option<String>) -> Result<Self, BackendError> {
        let http = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            http,
            endpoints,
            api_token,
        })
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Start a regeneration job and return its id.
    pub async fn start_regeneration(
        &self,
        organization_id: Option<i64>,
        items: Option<Vec<EmbeddingItem>>,
    ) -> Result<Uuid, BackendError> {
        let url = self.endpoints.regenerate_url();
        let body = serde_json::json!({
            "organization_id": organization_id,
            "items": items,
        });
        let response = self
            .authorized(self.http.post(&url))
            .json(&body)
            .send()
            .await?;
        let response = ensure_success(response, &url)?;
        let enqueued: EnqueuedResponse = response.json().await?;
        Ok(enqueued.job_id)
    }

    /// Job snapshot, `None` for unknown or expired ids.
    pub async fn fetch_job(&self, job_id: Uuid) -> Result<Option<JobProgress>, BackendError> {
        let url = self.endpoints.regenerate_url();
        let response = self
            .authorized(self.http.get(&url))
            .query(&[("jobId", job_id.to_string())])
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = ensure_success(response, &url)?;
        Ok(Some(response.json().await?))
    }

    /// Poll the job status endpoint until the job completes or fails.
    pub async fn wait_for_job(
        &self,
        job_id: Uuid,
        interval: Duration,
    ) -> Result<JobProgress, PollError<BackendError>> {
        poll_until_terminal(interval, None, || self.fetch_job(job_id)).await
    }
}

#[async_trait]
impl CheckBackend for BackendClient {
    async fn cancel_check(&self, check_id: CheckId) -> Result<(), BackendError> {
        let url = self.endpoints.cancel_url(check_id);
        let response = self.authorized(self.http.post(&url)).send().await?;
        ensure_success(response, &url)?;
        Ok(())
    }

    async fn fetch_check(&self, check_id: CheckId) -> Result<Option<Check>, BackendError> {
        let url = self.endpoints.check_url(check_id);
        let response = self.authorized(self.http.get(&url)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = ensure_success(response, &url)?;
        Ok(Some(response.json().await?))
    }
}

fn ensure_success(response: reqwest::Response, url: &str) -> Result<reqwest::Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(BackendError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Backend returned status {status} for {url}")]
    Status { url: String, status: u16 },
}
