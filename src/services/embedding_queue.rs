//! Background embedding regeneration jobs.
//!
//! `enqueue` returns a job id immediately and runs the batch on a detached
//! task. Items are processed one at a time; a failing item is logged and
//! counted, never aborting the batch. Job snapshots stay pollable in a
//! bounded registry until their retention window passes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::db::dictionary::DictionaryRepository;
use crate::models::job::{EmbeddingItem, EmbeddingJob, JobProgress, JobStatus};
use crate::services::embedding::{Embedder, EmbeddingError};

/// How long finished jobs stay pollable and how many the registry holds.
#[derive(Debug, Clone, Copy)]
pub struct JobRetention {
    pub capacity: usize,
    /// Measured from the moment a job finishes. Running jobs never expire.
    pub ttl: Duration,
}

impl Default for JobRetention {
    fn default() -> Self {
        Self {
            capacity: 256,
            ttl: Duration::from_secs(3600),
        }
    }
}

/// Decides the final status of a settled job.
#[derive(Debug, Clone, Copy)]
pub struct FailurePolicy {
    /// Highest tolerated `failed / total` ratio for a `completed` job.
    /// `1.0` marks every settled job completed and leaves the judgement of
    /// the failure count to the caller.
    pub max_failure_ratio: f64,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self {
            max_failure_ratio: 1.0,
        }
    }
}

impl FailurePolicy {
    pub fn final_status(&self, total: u64, failed: u64) -> JobStatus {
        if total == 0 {
            return JobStatus::Completed;
        }
        let ratio = failed as f64 / total as f64;
        if ratio > self.max_failure_ratio {
            JobStatus::Failed
        } else {
            JobStatus::Completed
        }
    }
}

struct JobRecord {
    job: EmbeddingJob,
    finished_at: Option<Instant>,
}

/// Bounded, TTL-expiring map of jobs.
struct JobRegistry {
    jobs: HashMap<Uuid, JobRecord>,
    retention: JobRetention,
}

impl JobRegistry {
    fn new(retention: JobRetention) -> Self {
        Self {
            jobs: HashMap::new(),
            retention,
        }
    }

    fn insert(&mut self, job: EmbeddingJob) {
        self.purge_expired(Instant::now());
        while self.jobs.len() >= self.retention.capacity {
            let oldest_finished = self
                .jobs
                .iter()
                .filter_map(|(id, r)| r.finished_at.map(|at| (*id, at)))
                .min_by_key(|(_, at)| *at)
                .map(|(id, _)| id);
            match oldest_finished {
                Some(id) => {
                    self.jobs.remove(&id);
                }
                None => {
                    tracing::warn!(
                        capacity = self.retention.capacity,
                        "Job registry full of running jobs, exceeding capacity"
                    );
                    break;
                }
            }
        }
        self.jobs.insert(
            job.id,
            JobRecord {
                job,
                finished_at: None,
            },
        );
    }

    fn get(&mut self, id: Uuid) -> Option<&EmbeddingJob> {
        self.purge_expired(Instant::now());
        self.jobs.get(&id).map(|r| &r.job)
    }

    fn update<F>(&mut self, id: Uuid, f: F) -> Option<EmbeddingJob>
    where
        F: FnOnce(&mut EmbeddingJob),
    {
        let record = self.jobs.get_mut(&id)?;
        f(&mut record.job);
        record.job.updated_at = chrono::Utc::now();
        if record.job.status.is_terminal() && record.finished_at.is_none() {
            record.finished_at = Some(Instant::now());
        }
        Some(record.job.clone())
    }

    fn purge_expired(&mut self, now: Instant) {
        let ttl = self.retention.ttl;
        self.jobs.retain(|_, r| match r.finished_at {
            Some(at) => now.duration_since(at) < ttl,
            None => true,
        });
    }
}

/// Runs embedding regeneration batches and keeps their progress pollable.
pub struct EmbeddingJobQueue {
    registry: Arc<Mutex<JobRegistry>>,
    embedder: Arc<dyn Embedder>,
    repository: Arc<dyn DictionaryRepository>,
    policy: FailurePolicy,
}

impl EmbeddingJobQueue {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        repository: Arc<dyn DictionaryRepository>,
        retention: JobRetention,
        policy: FailurePolicy,
    ) -> Self {
        Self {
            registry: Arc::new(Mutex::new(JobRegistry::new(retention))),
            embedder,
            repository,
            policy,
        }
    }

    /// Register a job for `items` and run it in the background.
    pub fn enqueue(&self, organization_id: Option<i64>, items: Vec<EmbeddingItem>) -> Uuid {
        let job = EmbeddingJob::new(organization_id, items.len() as u64);
        let job_id = job.id;
        self.registry().insert(job);
        metrics::counter!("embedding_jobs_total").increment(1);
        tracing::info!(job_id = %job_id, total = items.len(), "Embedding job queued");

        let worker = self.worker();
        tokio::spawn(async move {
            worker.run(job_id, items).await;
        });
        job_id
    }

    /// Run a job inline and return its final snapshot.
    pub async fn run_to_completion(
        &self,
        organization_id: Option<i64>,
        items: Vec<EmbeddingItem>,
    ) -> JobProgress {
        let job = EmbeddingJob::new(organization_id, items.len() as u64);
        let job_id = job.id;
        let fallback = JobProgress::from(&job);
        self.registry().insert(job);
        metrics::counter!("embedding_jobs_total").increment(1);

        self.worker()
            .run(job_id, items)
            .await
            .map(|job| JobProgress::from(&job))
            .unwrap_or(fallback)
    }

    /// Snapshot of a job, `None` when the id is unknown or expired.
    pub fn get_job(&self, job_id: Uuid) -> Option<JobProgress> {
        self.registry().get(job_id).map(JobProgress::from)
    }

    fn registry(&self) -> MutexGuard<'_, JobRegistry> {
        lock_registry(&self.registry)
    }

    fn worker(&self) -> Worker {
        Worker {
            registry: Arc::clone(&self.registry),
            embedder: Arc::clone(&self.embedder),
            repository: Arc::clone(&self.repository),
            policy: self.policy,
        }
    }
}

fn lock_registry(registry: &Mutex<JobRegistry>) -> MutexGuard<'_, JobRegistry> {
    registry.lock().unwrap_or_else(|poisoned| {
        tracing::error!("Job registry mutex poisoned, recovering");
        poisoned.into_inner()
    })
}

struct Worker {
    registry: Arc<Mutex<JobRegistry>>,
    embedder: Arc<dyn Embedder>,
    repository: Arc<dyn DictionaryRepository>,
    policy: FailurePolicy,
}

impl Worker {
    fn update<F>(&self, job_id: Uuid, f: F) -> Option<EmbeddingJob>
    where
        F: FnOnce(&mut EmbeddingJob),
    {
        lock_registry(&self.registry).update(job_id, f)
    }

    async fn run(&self, job_id: Uuid, items: Vec<EmbeddingItem>) -> Option<EmbeddingJob> {
        self.update(job_id, |job| job.status = JobStatus::Processing);
        let started = Instant::now();

        for item in &items {
            match self.process(item).await {
                Ok(()) => {
                    metrics::counter!("embedding_items_processed_total").increment(1);
                    self.update(job_id, |job| job.processed += 1);
                }
                Err(e) => {
                    metrics::counter!("embedding_items_failed_total").increment(1);
                    tracing::warn!(
                        job_id = %job_id,
                        phrase_id = item.id,
                        error = %e,
                        "Embedding regeneration failed for phrase"
                    );
                    self.update(job_id, |job| job.failed += 1);
                }
            }
        }

        let policy = self.policy;
        let finished = self.update(job_id, |job| {
            debug_assert!(job.is_settled(), "job finalised with items left");
            debug_assert!(job.processed + job.failed <= job.total);
            job.status = policy.final_status(job.total, job.failed);
        });
        if let Some(job) = &finished {
            tracing::info!(
                job_id = %job_id,
                status = %job.status,
                processed = job.processed,
                failed = job.failed,
                duration_ms = started.elapsed().as_millis() as u64,
                "Embedding job finished"
            );
        }
        finished
    }

    async fn process(&self, item: &EmbeddingItem) -> Result<(), EmbeddingError> {
        let embedding = self.embedder.embed(&item.phrase).await?;
        self.repository.save_embedding(item.id, &embedding).await?;
        Ok(())
    }
}
