use std::sync::Arc;

use crate::db::dictionary::DictionaryRepository;
use crate::services::embedding_queue::EmbeddingJobQueue;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub repository: Arc<dyn DictionaryRepository>,
    pub jobs: Arc<EmbeddingJobQueue>,
}

impl AppState {
    pub fn new(repository: Arc<dyn DictionaryRepository>, jobs: EmbeddingJobQueue) -> Self {
        Self {
            repository,
            jobs: Arc::new(jobs),
        }
    }
}
