//! Incremental `text/event-stream` decoder.

/// Comment prefix the backend uses for keep-alive lines.
pub const HEARTBEAT_PREFIX: &str = ": heartbeat";

/// A dispatched server-sent event.
#[derive(Debug, Clone, PartialEq)]
pub struct SseFrame {
    /// Event name; `message` when the server did not name it.
    pub event: String,
    pub data: String,
    pub id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SseItem {
    Frame(SseFrame),
    /// A comment line. Keeps the stream alive, never carries data.
    Heartbeat,
    /// A line that could not be decoded. It is skipped and decoding goes on.
    Invalid(SseError),
}

/// Whether a raw line or data body is a keep-alive rather than JSON.
pub fn is_heartbeat(text: &str) -> bool {
    text.trim_start().starts_with(':')
}

/// Splits a byte stream into SSE items. Chunk boundaries may fall anywhere,
/// including inside a line.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseItem> {
        self.buffer.extend_from_slice(chunk);

        let mut items = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=newline).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            match String::from_utf8(line) {
                Ok(line) => items.extend(self.process_line(&line)),
                Err(e) => items.push(SseItem::Invalid(SseError::Utf8(e))),
            }
        }
        items
    }

    fn process_line(&mut self, line: &str) -> Option<SseItem> {
        if line.is_empty() {
            return self.dispatch().map(SseItem::Frame);
        }
        if line.starts_with(':') {
            return Some(SseItem::Heartbeat);
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            // `retry` and unknown fields are ignored
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        let id = self.id.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseFrame {
            event: event
                .filter(|e| !e.is_empty())
                .unwrap_or_else(|| "message".to_string()),
            data,
            id,
        })
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SseError {
    #[error("Event stream is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(items: Vec<SseItem>) -> Vec<SseFrame> {
        items
            .into_iter()
            .filter_map(|item| match item {
                SseItem::Frame(frame) => Some(frame),
                SseItem::Heartbeat | SseItem::Invalid(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_named_event() {
        let mut decoder = SseDecoder::new();
        let items = decoder.feed(b"event: complete\ndata: {\"id\":1}\n\n");
        assert_eq!(
            items,
            vec![SseItem::Frame(SseFrame {
                event: "complete".to_string(),
                data: "{\"id\":1}".to_string(),
                id: None,
            })]
        );
    }

    #[test]
    fn test_unnamed_event_defaults_to_message() {
        let mut decoder = SseDecoder::new();
        let parsed = frames(decoder.feed(b"id: 4\ndata: {}\n\n"));
        assert_eq!(parsed[0].event, "message");
        assert_eq!(parsed[0].id.as_deref(), Some("4"));
    }

    #[test]
    fn test_chunks_split_mid_line() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"event: prog").is_empty());
        assert!(decoder.feed(b"ress\r\ndata: {\"ocr_status\":").is_empty());
        let parsed = frames(decoder.feed(b"\"pending\"}\r\n\r\n"));
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].event, "progress");
        assert_eq!(parsed[0].data, "{\"ocr_status\":\"pending\"}");
    }

    #[test]
    fn test_multiline_data_is_joined() {
        let mut decoder = SseDecoder::new();
        let parsed = frames(decoder.feed(b"data: first\ndata: second\n\n"));
        assert_eq!(parsed[0].data, "first\nsecond");
    }

    #[test]
    fn test_heartbeat_is_not_a_frame() {
        let mut decoder = SseDecoder::new();
        let items = decoder.feed(b": heartbeat\n\n");
        assert_eq!(items, vec![SseItem::Heartbeat]);
        assert!(is_heartbeat(HEARTBEAT_PREFIX));
        assert!(!is_heartbeat("{\"type\":\"queue_status\"}"));
    }

    #[test]
    fn test_blank_block_dispatches_nothing() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"event: progress\n\n\n").is_empty());
    }

    #[test]
    fn test_invalid_utf8_line_is_reported() {
        let mut decoder = SseDecoder::new();
        let items = decoder.feed(&[b'd', b'a', 0xff, b'\n']);
        assert!(matches!(items.as_slice(), [SseItem::Invalid(SseError::Utf8(_))]));
    }

    #[test]
    fn test_invalid_line_keeps_surrounding_frames() {
        let mut decoder = SseDecoder::new();
        let mut chunk = b"event: complete\ndata: {\"id\":1}\n\n".to_vec();
        chunk.extend_from_slice(&[b'd', b'a', b't', b'a', b':', b' ', 0xc3, 0x28, b'\n']);
        chunk.extend_from_slice(b"event: progress\ndata: {}\n\n");

        let items = decoder.feed(&chunk);
        assert_eq!(items.len(), 3);
        assert!(matches!(items[1], SseItem::Invalid(_)));

        let parsed = frames(items);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].event, "complete");
        assert_eq!(parsed[0].data, "{\"id\":1}");
        assert_eq!(parsed[1].event, "progress");
        assert_eq!(parsed[1].data, "{}");
    }
}
