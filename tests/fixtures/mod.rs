//! Sample SSE traffic as the hosted backend emits it.

use check_notify::services::sse::SseFrame;
use check_notify::services::transport::StreamEvent;

pub const BACKEND_URL: &str = "http://backend.test";

fn frame(event: &str, data: &str) -> StreamEvent {
    StreamEvent::Frame(SseFrame {
        event: event.to_string(),
        data: data.to_string(),
        id: None,
    })
}

pub fn progress_ocr() -> StreamEvent {
    frame("progress", r#"{"ocr_status":"processing"}"#)
}

pub fn progress_analysis() -> StreamEvent {
    frame("progress", r#"{"ocr_status":"completed"}"#)
}

/// A completion whose second violation overruns the text and is reversed.
pub fn complete(check_id: i64) -> StreamEvent {
    frame(
        "complete",
        &format!(
            r#"{{"id":{check_id},"original_text":"Buy now, cure all","modified_text":"Buy now","status":"completed","violations":[{{"id":1,"start_pos":0,"end_pos":7,"reason":"urgency","dictionary_id":12}},{{"id":2,"start_pos":40,"end_pos":9,"reason":"health claim"}}]}}"#
        ),
    )
}

pub fn error(reason: &str) -> StreamEvent {
    frame("error", &format!(r#"{{"error":"{reason}"}}"#))
}

pub fn queue_status(pending: u64, processing: u64) -> StreamEvent {
    frame(
        "message",
        &format!(
            r#"{{"type":"queue_status","queue":{{"pending":{pending},"processing":{processing},"completed":10,"failed":1}},"organization":{{"organization_id":3,"active_checks":2,"checks_used":40,"checks_limit":100}},"system":{{"status":"healthy","message":null}}}}"#
        ),
    )
}

pub fn heartbeat() -> StreamEvent {
    StreamEvent::Heartbeat
}
