use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

/// Produces a vector embedding for a dictionary phrase.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

/// Client for Cloudflare Workers AI text embedding models.
pub struct WorkersAiEmbedder {
    http: Client,
    account_id: String,
    api_token: String,
    model: String,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    text: [&'a str; 1],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    result: EmbeddingResult,
}

#[derive(Deserialize)]
struct EmbeddingResult {
    data: Vec<Vec<f32>>,
}

impl WorkersAiEmbedder {
    pub fn new(account_id: &str, api_token: &str, model: &str) -> Self {
        Self {
            http: Client::new(),
            account_id: account_id.to_string(),
            api_token: api_token.to_string(),
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl Embedder for WorkersAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let url = format!(
            "https://api.cloudflare.com/client/v4/accounts/{}/ai/run/{}",
            self.account_id, self.model
        );

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_token)
            .json(&EmbeddingRequest { text: [text] })
            .send()
            .await?
            .error_for_status()?;

        let body: EmbeddingResponse = response.json().await?;
        body.result
            .data
            .into_iter()
            .next()
            .filter(|v| !v.is_empty())
            .ok_or(EmbeddingError::EmptyResponse)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Embedding model returned no vector")]
    EmptyResponse,

    #[error("Failed to store embedding: {0}")]
    Store(#[from] sqlx::Error),
}
