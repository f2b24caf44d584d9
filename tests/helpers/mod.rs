//! Fakes and polling helpers shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use check_notify::db::dictionary::DictionaryRepository;
use check_notify::models::check::{Check, CheckId};
use check_notify::models::job::EmbeddingItem;
use check_notify::services::backend::{BackendError, CheckBackend};
use check_notify::services::embedding::{Embedder, EmbeddingError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Backend that records cancel calls and knows no checks.
#[derive(Default)]
pub struct RecordingBackend {
    pub cancels: Mutex<Vec<CheckId>>,
    pub fail_cancel: bool,
}

impl RecordingBackend {
    pub fn cancelled(&self) -> Vec<CheckId> {
        self.cancels.lock().unwrap().clone()
    }
}

#[async_trait]
impl CheckBackend for RecordingBackend {
    async fn cancel_check(&self, check_id: CheckId) -> Result<(), BackendError> {
        self.cancels.lock().unwrap().push(check_id);
        if self.fail_cancel {
            return Err(BackendError::Status {
                url: format!("cancel/{check_id}"),
                status: 502,
            });
        }
        Ok(())
    }

    async fn fetch_check(&self, _check_id: CheckId) -> Result<Option<Check>, BackendError> {
        Ok(None)
    }
}

/// Dictionary kept in memory, keyed by organization.
#[derive(Default)]
pub struct MemoryDictionary {
    pub phrases: HashMap<i64, Vec<EmbeddingItem>>,
    pub saved: Mutex<HashMap<i64, usize>>,
}

impl MemoryDictionary {
    pub fn with_phrases(organization_id: i64, phrases: &[&str]) -> Self {
        Self::default().and_phrases(organization_id, phrases)
    }

    /// Add an organization whose phrase ids continue after the existing ones.
    pub fn and_phrases(mut self, organization_id: i64, phrases: &[&str]) -> Self {
        let first_id = self.phrases.values().map(Vec::len).sum::<usize>() as i64 + 1;
        let items = phrases
            .iter()
            .enumerate()
            .map(|(i, phrase)| EmbeddingItem {
                id: first_id + i as i64,
                phrase: phrase.to_string(),
            })
            .collect();
        self.phrases.insert(organization_id, items);
        self
    }

    pub fn saved_count(&self) -> usize {
        self.saved.lock().unwrap().len()
    }
}

#[async_trait]
impl DictionaryRepository for MemoryDictionary {
    async fn list_phrases(
        &self,
        organization_id: Option<i64>,
    ) -> Result<Vec<EmbeddingItem>, sqlx::Error> {
        let phrases = match organization_id {
            Some(id) => self.phrases.get(&id).cloned().unwrap_or_default(),
            None => self.phrases.values().flatten().cloned().collect(),
        };
        Ok(phrases)
    }

    async fn save_embedding(&self, phrase_id: i64, embedding: &[f32]) -> Result<(), sqlx::Error> {
        self.saved.lock().unwrap().insert(phrase_id, embedding.len());
        Ok(())
    }

    async fn ping(&self) -> Result<(), sqlx::Error> {
        Ok(())
    }
}

/// Embeds every phrase except those containing "reject".
#[derive(Default)]
pub struct FixedEmbedder {
    pub calls: AtomicUsize,
}

#[async_trait]
impl Embedder for FixedEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if text.contains("reject") {
            return Err(EmbeddingError::EmptyResponse);
        }
        Ok(vec![0.25; 8])
    }
}

/// Poll `condition` every few milliseconds for up to two seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
