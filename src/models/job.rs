use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Status of an embedding regeneration job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// One dictionary phrase whose embedding should be regenerated.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct EmbeddingItem {
    #[garde(range(min = 1))]
    pub id: i64,

    #[garde(length(min = 1, max = 2000))]
    pub phrase: String,
}

/// A background embedding regeneration job.
///
/// `processed + failed <= total` holds for the whole lifetime of the job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingJob {
    pub id: Uuid,
    pub organization_id: Option<i64>,
    pub status: JobStatus,
    pub total: u64,
    pub processed: u64,
    pub failed: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EmbeddingJob {
    pub fn new(organization_id: Option<i64>, total: u64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            organization_id,
            status: JobStatus::Queued,
            total,
            processed: 0,
            failed: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Percentage of items embedded successfully. Failures do not count.
    pub fn progress(&self) -> u8 {
        if self.total == 0 {
            return 0;
        }
        (self.processed as f64 / self.total as f64 * 100.0).round() as u8
    }

    pub fn is_settled(&self) -> bool {
        self.processed + self.failed >= self.total
    }
}

/// Pollable snapshot returned by the job status endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobProgress {
    pub id: Uuid,
    pub status: JobStatus,
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub progress: u8,
}

impl From<&EmbeddingJob> for JobProgress {
    fn from(job: &EmbeddingJob) -> Self {
        Self {
            id: job.id,
            status: job.status,
            total: job.total,
            completed: job.processed,
            failed: job.failed,
            progress: job.progress(),
        }
    }
}

/// Body of `POST /api/v1/embeddings/regenerate`. Every field is optional.
#[derive(Debug, Default, Deserialize)]
pub struct RegenerateRequest {
    #[serde(default)]
    pub organization_id: Option<i64>,
    #[serde(default)]
    pub items: Option<Vec<EmbeddingItem>>,
    /// Run inline and answer with the legacy completion payload.
    #[serde(default)]
    pub wait: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EnqueuedResponse {
    #[serde(rename = "jobId")]
    pub job_id: Uuid,
}

/// Synchronous completion payload kept for older callers.
#[derive(Debug, Serialize, Deserialize)]
pub struct LegacyRegenerateResponse {
    pub success: bool,
    pub total: u64,
    pub processed: u64,
    pub failed: u64,
    pub message: String,
}

impl From<&JobProgress> for LegacyRegenerateResponse {
    fn from(progress: &JobProgress) -> Self {
        Self {
            success: progress.status == JobStatus::Completed,
            total: progress.total,
            processed: progress.completed,
            failed: progress.failed,
            message: format!(
                "Regenerated {} of {} embeddings ({} failed)",
                progress.completed, progress.total, progress.failed
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_counts_successes_only() {
        let mut job = EmbeddingJob::new(None, 10);
        job.processed = 7;
        job.failed = 2;
        assert_eq!(job.progress(), 70);
        assert!(!job.is_settled());

        job.failed = 3;
        assert!(job.is_settled());
    }

    #[test]
    fn test_progress_of_empty_job_is_zero() {
        assert_eq!(EmbeddingJob::new(Some(1), 0).progress(), 0);
    }

    #[test]
    fn test_progress_rounds() {
        let mut job = EmbeddingJob::new(None, 3);
        job.processed = 2;
        assert_eq!(job.progress(), 67);
    }

    #[test]
    fn test_job_progress_wire_names() {
        let job = EmbeddingJob::new(None, 4);
        let json = serde_json::to_value(JobProgress::from(&job)).unwrap();
        assert_eq!(json["status"], "queued");
        assert_eq!(json["completed"], 0);
        assert_eq!(json["progress"], 0);
    }

    #[test]
    fn test_item_validation() {
        let item = EmbeddingItem {
            id: 3,
            phrase: String::new(),
        };
        assert!(item.validate().is_err());
    }
}
