//! Incremental `text/event-stream` parser
//!
//! Fed raw body chunks in whatever sizes the network delivers them; emits a
//! [`SseFrame`] at each blank line. Lines may end in LF, CR or CRLF, and a
//! CRLF split across two chunks is still one line ending.

/// One dispatched stream event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    /// `event:` field, `message` when absent
    pub event: String,
    /// `data:` lines joined with `\n`
    pub data: String,
    /// Last seen `id:` field
    pub id: Option<String>,
}

#[derive(Debug, Default)]
pub struct SseParser {
    line: Vec<u8>,
    skip_lf: bool,
    event: String,
    data: String,
    last_id: Option<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_event_id(&self) -> Option<&str> {
        self.last_id.as_deref()
    }

    /// Consume a chunk and return every event it completed
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        let mut frames = Vec::new();

        for &byte in chunk {
            if std::mem::take(&mut self.skip_lf) && byte == b'\n' {
                continue;
            }
            match byte {
                b'\r' => {
                    self.skip_lf = true;
                    self.end_line(&mut frames);
                }
                b'\n' => self.end_line(&mut frames),
                _ => self.line.push(byte),
            }
        }

        frames
    }

    fn end_line(&mut self, frames: &mut Vec<SseFrame>) {
        let raw = std::mem::take(&mut self.line);
        let line = String::from_utf8_lossy(&raw);

        if line.is_empty() {
            if let Some(frame) = self.dispatch() {
                frames.push(frame);
            }
            return;
        }

        // Comment
        if line.starts_with(':') {
            return;
        }

        let (field, value) = match line.find(':') {
            Some(i) => {
                let value = &line[i + 1..];
                (&line[..i], value.strip_prefix(' ').unwrap_or(value))
            }
            None => (&line[..], ""),
        };

        match field {
            "event" => self.event = value.to_string(),
            "data" => {
                self.data.push_str(value);
                self.data.push('\n');
            }
            "id" if !value.contains('\0') => self.last_id = Some(value.to_string()),
            // `retry` and unknown fields are ignored
            _ => {}
        }
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = std::mem::take(&mut self.event);
        let mut data = std::mem::take(&mut self.data);
        if data.is_empty() {
            return None;
        }
        data.pop();

        Some(SseFrame {
            event: if event.is_empty() {
                "message".to_string()
            } else {
                event
            },
            data,
            id: self.last_id.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_event_with_multiline_data() {
        let mut parser = SseParser::new();
        let frames = parser.feed(b"event: bus-location-update\ndata: {\"busId\":\ndata: \"b1\"}\n\n");

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, "bus-location-update");
        assert_eq!(frames[0].data, "{\"busId\":\n\"b1\"}");
    }

    #[test]
    fn test_default_event_type_and_id() {
        let mut parser = SseParser::new();
        let frames = parser.feed(b"id: 42\ndata: hello\n\n");

        assert_eq!(frames[0].event, "message");
        assert_eq!(frames[0].id.as_deref(), Some("42"));
        assert_eq!(parser.last_event_id(), Some("42"));
    }

    #[test]
    fn test_comments_retry_and_empty_blocks_are_skipped() {
        let mut parser = SseParser::new();
        let frames = parser.feed(b": keep-alive\n\nretry: 5000\n\nevent: route-update\n\n");
        assert!(frames.is_empty());

        // The event type of an undispatched block does not leak forward
        let frames = parser.feed(b"data: x\n\n");
        assert_eq!(frames[0].event, "message");
    }

    #[test]
    fn test_line_endings_split_across_chunks() {
        let mut parser = SseParser::new();
        let mut frames = parser.feed(b"event: system-notification\r");
        frames.extend(parser.feed(b"\ndata: {}\r"));
        frames.extend(parser.feed(b"\n\r\n"));
        frames.extend(parser.feed(b"data: cr-only\r\r"));

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].event, "system-notification");
        assert_eq!(frames[0].data, "{}");
        assert_eq!(frames[1].data, "cr-only");
    }

    #[test]
    fn test_utf8_split_across_chunks() {
        let text = "data: café\n\n".as_bytes();
        let (head, tail) = text.split_at(10);
        let mut parser = SseParser::new();

        assert!(parser.feed(head).is_empty());
        let frames = parser.feed(tail);
        assert_eq!(frames[0].data, "café");
    }

    #[test]
    fn test_field_without_colon_and_empty_data() {
        let mut parser = SseParser::new();
        let frames = parser.feed(b"data\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "");
    }
}
