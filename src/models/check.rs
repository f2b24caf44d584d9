use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

pub type CheckId = i64;

/// Lifecycle of a submitted check.
///
/// `pending -> processing -> {completed | failed | cancelled}`. Terminal
/// states are final.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq, Hash,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CheckStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl CheckStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CheckStatus::Completed | CheckStatus::Failed | CheckStatus::Cancelled
        )
    }

    /// Whether the state machine allows moving from `self` to `next`.
    /// Repeated `processing` is allowed so progress frames can refresh the message.
    pub fn can_transition_to(self, next: CheckStatus) -> bool {
        match (self, next) {
            (current, _) if current.is_terminal() => false,
            (CheckStatus::Processing, CheckStatus::Pending) => false,
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum InputType {
    Text,
    Image,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OcrStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// A violation as the backend sends it, both in `complete` frames and in
/// the check resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ViolationPayload {
    pub id: i64,
    pub start_pos: i64,
    pub end_pos: i64,
    pub reason: String,
    #[serde(default)]
    pub dictionary_id: Option<i64>,
}

impl ViolationPayload {
    /// Rename wire fields and repair offsets against the original text.
    pub fn normalize(self, text_len: usize) -> Violation {
        let clamp = |pos: i64| usize::try_from(pos.max(0)).unwrap_or(usize::MAX).min(text_len);
        let (mut start, mut end) = (clamp(self.start_pos), clamp(self.end_pos));
        if start > end {
            std::mem::swap(&mut start, &mut end);
        }
        Violation {
            id: self.id,
            start,
            end,
            reason: self.reason,
            dictionary_id: self.dictionary_id,
        }
    }
}

/// A flagged span of a check's original text. Offsets are character
/// offsets with `0 <= start <= end <= len(original_text)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Violation {
    pub id: i64,
    pub start: usize,
    pub end: usize,
    pub reason: String,
    pub dictionary_id: Option<i64>,
}

/// A check as stored by the hosted backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Check {
    pub id: CheckId,
    pub organization_id: i64,
    pub user_id: String,
    pub original_text: String,
    pub modified_text: Option<String>,
    pub status: CheckStatus,
    pub input_type: InputType,
    pub ocr_status: Option<OcrStatus>,
    #[serde(default)]
    pub violations: Vec<ViolationPayload>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Check {
    pub fn normalized_violations(&self) -> Vec<Violation> {
        let text_len = self.original_text.chars().count();
        self.violations
            .iter()
            .cloned()
            .map(|v| v.normalize(text_len))
            .collect()
    }
}

/// A state change derived from a stream frame, a poll result or a cancel.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckUpdate {
    Progress {
        ocr_status: Option<OcrStatus>,
        message: String,
    },
    Completed {
        original_text: String,
        modified_text: Option<String>,
        violations: Vec<Violation>,
    },
    Failed {
        message: String,
    },
    /// Live updates were interrupted; status is left untouched.
    Degraded {
        message: String,
    },
    Cancelled,
}

/// Client-side view of one check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckState {
    pub id: CheckId,
    pub status: CheckStatus,
    pub message: Option<String>,
    pub ocr_status: Option<OcrStatus>,
    pub original_text: Option<String>,
    pub modified_text: Option<String>,
    pub violations: Vec<Violation>,
    pub degraded: bool,
    pub updated_at: DateTime<Utc>,
}

impl CheckState {
    pub fn new(id: CheckId) -> Self {
        Self {
            id,
            status: CheckStatus::Pending,
            message: None,
            ocr_status: None,
            original_text: None,
            modified_text: None,
            violations: Vec::new(),
            degraded: false,
            updated_at: Utc::now(),
        }
    }

    /// Apply an update. Returns `false` when the state machine rejects it,
    /// in which case the state is left as it was.
    pub fn apply(&mut self, update: CheckUpdate) -> bool {
        let next = match &update {
            CheckUpdate::Progress { .. } => CheckStatus::Processing,
            CheckUpdate::Completed { .. } => CheckStatus::Completed,
            CheckUpdate::Failed { .. } => CheckStatus::Failed,
            CheckUpdate::Cancelled => CheckStatus::Cancelled,
            CheckUpdate::Degraded { .. } => self.status,
        };
        if !self.status.can_transition_to(next) {
            return false;
        }

        match update {
            CheckUpdate::Progress {
                ocr_status,
                message,
            } => {
                self.ocr_status = ocr_status.or(self.ocr_status);
                self.message = Some(message);
                self.degraded = false;
            }
            CheckUpdate::Completed {
                original_text,
                modified_text,
                violations,
            } => {
                self.original_text = Some(original_text);
                self.modified_text = modified_text;
                self.violations = violations;
                self.message = Some(format!(
                    "Check completed with {} violation(s)",
                    self.violations.len()
                ));
                self.degraded = false;
            }
            CheckUpdate::Failed { message } => self.message = Some(message),
            CheckUpdate::Degraded { message } => {
                self.message = Some(message);
                self.degraded = true;
            }
            CheckUpdate::Cancelled => self.message = Some("Check cancelled".to_string()),
        }
        self.status = next;
        self.updated_at = Utc::now();
        true
    }
}
