//! Incremental SSE frame parser for the legacy client transport.
//!
//! Inbound bytes are buffered and split on blank-line event boundaries,
//! then `event:`/`data:`/`id:` fields are pulled out per the
//! server-sent-events wire format. One deliberate quirk: a chunk with no
//! field-prefixed lines at all is treated as a bare-JSON event, because
//! older servers emit raw JSON frames on the same stream.

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawSseEvent {
    pub event: Option<String>,
    pub data: Option<String>,
    pub id: Option<String>,
}

#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one network chunk; returns every event completed by it.
    pub fn push(&mut self, chunk: &str) -> Vec<RawSseEvent> {
        self.buffer.push_str(&chunk.replace("\r\n", "\n"));
        let mut events = Vec::new();
        while let Some(boundary) = self.buffer.find("\n\n") {
            let frame: String = self.buffer.drain(..boundary + 2).collect();
            if let Some(event) = Self::parse_frame(frame.trim_end_matches('\n')) {
                events.push(event);
            }
        }
        events
    }

    fn parse_frame(frame: &str) -> Option<RawSseEvent> {
        if frame.trim().is_empty() {
            return None;
        }
        let mut event = RawSseEvent::default();
        let mut data_lines: Vec<&str> = Vec::new();
        let mut saw_field = false;
        for line in frame.lines() {
            if let Some(rest) = line.strip_prefix("data:") {
                data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
                saw_field = true;
            } else if let Some(rest) = line.strip_prefix("event:") {
                event.event = Some(rest.trim().to_string());
                saw_field = true;
            } else if let Some(rest) = line.strip_prefix("id:") {
                event.id = Some(rest.trim().to_string());
                saw_field = true;
            } else if line.starts_with(':') {
                // Comment line, keep-alive noise.
                saw_field = true;
            }
        }
        if !data_lines.is_empty() {
            event.data = Some(data_lines.join("\n"));
        } else if !saw_field {
            // Bare-JSON frame with no SSE fields at all.
            event.data = Some(frame.trim().to_string());
        }
        if event.event.is_none() && event.data.is_none() && event.id.is_none() {
            None
        } else {
            Some(event)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoint_event() {
        let mut parser = SseParser::new();
        let events = parser.push("event: endpoint\ndata: /messages?sessionId=abc\n\n");
        assert_eq!(
            events,
            vec![RawSseEvent {
                event: Some("endpoint".to_string()),
                data: Some("/messages?sessionId=abc".to_string()),
                id: None,
            }]
        );
    }

    #[test]
    fn test_partial_chunks_buffer_until_blank_line() {
        let mut parser = SseParser::new();
        assert!(parser.push("event: message\n").is_empty());
        assert!(parser.push("data: {\"jsonrpc\":\"2.0\"").is_empty());
        let events = parser.push(",\"method\":\"ping\",\"id\":1}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].data.as_deref(),
            Some(r#"{"jsonrpc":"2.0","method":"ping","id":1}"#)
        );
    }

    #[test]
    fn test_multiple_events_in_one_chunk() {
        let mut parser = SseParser::new();
        let events =
            parser.push("event: message\nid: 1\ndata: {}\n\nevent: message\nid: 2\ndata: {}\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].id.as_deref(), Some("1"));
        assert_eq!(events[1].id.as_deref(), Some("2"));
    }

    #[test]
    fn test_bare_json_chunk_is_a_data_event() {
        let mut parser = SseParser::new();
        let events = parser.push("{\"jsonrpc\":\"2.0\",\"id\":3,\"result\":{}}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, None);
        assert_eq!(
            events[0].data.as_deref(),
            Some(r#"{"jsonrpc":"2.0","id":3,"result":{}}"#)
        );
    }

    #[test]
    fn test_multiline_data_joins_with_newline() {
        let mut parser = SseParser::new();
        let events = parser.push("data: line one\ndata: line two\n\n");
        assert_eq!(events[0].data.as_deref(), Some("line one\nline two"));
    }

    #[test]
    fn test_crlf_normalization() {
        let mut parser = SseParser::new();
        let events = parser.push("event: ping\r\ndata: {}\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("ping"));
    }

    #[test]
    fn test_comment_only_frame_is_dropped() {
        let mut parser = SseParser::new();
        assert!(parser.push(": keep-alive\n\n").is_empty());
    }
}
