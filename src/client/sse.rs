//! Incremental Server-Sent Events parser for the push channel.
//!
//! ```text
//! : keep-alive
//! event: session_info
//! data: {"type":"session_info", ...}
//!
//! ```

/// One parsed SSE event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    /// `event:` field.
    pub event: Option<String>,
    /// `data:` lines joined with `\n`.
    pub data: String,
    /// `id:` field.
    pub id: Option<String>,
}

#[derive(Debug, Default)]
struct Pending {
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
}

impl Pending {
    fn take(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() {
            self.event = None;
            return None;
        }
        let event = SseEvent {
            event: self.event.take(),
            data: self.data.join("\n"),
            id: self.id.take(),
        };
        self.data.clear();
        Some(event)
    }

    fn line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.take();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" => self.data.push(value.to_owned()),
            "event" => self.event = Some(value.to_owned()),
            "id" => self.id = Some(value.to_owned()),
            _ => {}
        }
        None
    }
}

/// Feed arbitrary byte chunks; complete events come out.
///
/// Bytes are buffered until a full line is available, so multi-byte UTF-8
/// characters split across chunks decode correctly.
#[derive(Debug, Default)]
pub struct SseLineParser {
    buf: Vec<u8>,
    pending: Pending,
}

impl SseLineParser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            let line = line.strip_suffix('\r').unwrap_or(&line);
            if let Some(event) = self.pending.line(line) {
                events.push(event);
            }
        }
        events
    }

    /// Emit whatever is buffered when the stream ends.
    pub fn flush(&mut self) -> Option<SseEvent> {
        if !self.buf.is_empty() {
            let raw = std::mem::take(&mut self.buf);
            let line = String::from_utf8_lossy(&raw);
            let line = line.strip_suffix('\r').unwrap_or(&line);
            self.pending.line(line);
        }
        self.pending.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_event_and_data() {
        let mut p = SseLineParser::new();
        let events = p.push(b"event: ready\ndata: {\"type\":\"ready\"}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("ready"));
        assert_eq!(events[0].data, r#"{"type":"ready"}"#);
    }

    #[test]
    fn comments_and_crlf() {
        let mut p = SseLineParser::new();
        let events = p.push(b": keep-alive\r\n\r\ndata:x\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn split_utf8_across_chunks() {
        let mut p = SseLineParser::new();
        let bytes = "data: café\n\n".as_bytes();
        let split = bytes.iter().position(|b| *b == 0xC3).unwrap() + 1;
        assert!(p.push(&bytes[..split]).is_empty());
        let events = p.push(&bytes[split..]);
        assert_eq!(events[0].data, "café");
    }

    #[test]
    fn multi_line_data_and_flush() {
        let mut p = SseLineParser::new();
        assert!(p.push(b"data: a\ndata: b\n\ndata: tail").len() == 1);
        let tail = p.flush().unwrap();
        assert_eq!(tail.data, "tail");
        assert!(p.flush().is_none());
    }
}
