//! Payloads carried by the two SSE stream families.
//!
//! Per-check streams use named events (`progress`, `complete`, `error`).
//! The global stream uses unnamed `message` events whose JSON body carries a
//! `type` discriminator.

use serde::{Deserialize, Serialize};

use crate::models::check::{CheckId, ViolationPayload};
use crate::services::sse::SseFrame;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProgressPayload {
    #[serde(default)]
    pub ocr_status: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletePayload {
    pub id: CheckId,
    pub original_text: String,
    #[serde(default)]
    pub modified_text: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub violations: Vec<ViolationPayload>,
}

/// Application-level failure reported by the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorPayload {
    pub error: String,
}

/// Typed per-check event.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckEvent {
    Progress(ProgressPayload),
    Complete(CompletePayload),
    Error(ErrorPayload),
}

impl CheckEvent {
    /// Decode a named frame. Unknown event names yield `Ok(None)`.
    pub fn decode(frame: &SseFrame) -> Result<Option<Self>, serde_json::Error> {
        let event = match frame.event.as_str() {
            "progress" => CheckEvent::Progress(serde_json::from_str(&frame.data)?),
            "complete" => CheckEvent::Complete(serde_json::from_str(&frame.data)?),
            "error" => CheckEvent::Error(serde_json::from_str(&frame.data)?),
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueMetrics {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrganizationUsage {
    pub organization_id: Option<i64>,
    pub active_checks: u64,
    pub checks_used: u64,
    pub checks_limit: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SystemHealth {
    pub status: String,
    pub message: Option<String>,
}

/// Body of a `queue_status` frame on the global stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QueueStatus {
    #[serde(default)]
    pub queue: QueueMetrics,
    #[serde(default)]
    pub organization: Option<OrganizationUsage>,
    #[serde(default)]
    pub system: SystemHealth,
}

impl QueueStatus {
    /// Decode a global stream body. Bodies with another `type` yield `Ok(None)`.
    pub fn decode(data: &str) -> Result<Option<Self>, serde_json::Error> {
        let value: serde_json::Value = serde_json::from_str(data)?;
        if value.get("type").and_then(|t| t.as_str()) != Some("queue_status") {
            return Ok(None);
        }
        serde_json::from_value(value).map(Some)
    }
}
