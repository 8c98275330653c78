//! Server-sent-events line handling shared by every SSE-speaking format.
//!
//! Upstream bodies arrive as arbitrary byte chunks; `LineBuffer` reassembles
//! complete lines across chunk boundaries and keeps the trailing partial line
//! for the next read.

/// One parsed SSE line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseLine {
    /// `event: <type>`
    Event(String),
    /// `data: <payload>`
    Data(String),
    /// `data: [DONE]` terminator (OpenAI family).
    Done,
}

/// Parse a single non-empty SSE line. Comments (`:`) and unknown fields
/// return `None`.
pub fn parse_sse_line(line: &str) -> Option<SseLine> {
    if let Some(event_type) = line.strip_prefix("event:") {
        return Some(SseLine::Event(event_type.trim().to_string()));
    }
    if let Some(data) = line.strip_prefix("data:") {
        let data = data.trim();
        if data == "[DONE]" {
            return Some(SseLine::Done);
        }
        return Some(SseLine::Data(data.to_string()));
    }
    None
}

/// Accumulates raw bytes and yields complete lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: String,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, get every complete line it closed. Invalid UTF-8 chunks
    /// are dropped whole, matching the tolerant upstream readers.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let Ok(text) = std::str::from_utf8(chunk) else {
            return Vec::new();
        };
        self.buf.push_str(text);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }
        lines
    }

    /// Whatever is left when the stream ends (a final unterminated line).
    pub fn take_remainder(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buf);
        let rest = rest.trim();
        if rest.is_empty() {
            None
        } else {
            Some(rest.to_string())
        }
    }
}

/// Frame a JSON payload as a plain `data:` SSE event.
pub fn data_frame(payload: &str) -> String {
    format!("data: {payload}\n\n")
}

/// Frame a JSON payload as a typed SSE event (`event:` + `data:`).
pub fn event_frame(event: &str, payload: &str) -> String {
    format!("event: {event}\ndata: {payload}\n\n")
}

/// The OpenAI-family stream terminator.
pub fn done_frame() -> String {
    "data: [DONE]\n\n".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_split_across_chunks() {
        let mut buf = LineBuffer::new();
        assert!(buf.push(b"data: {\"a\":").is_empty());
        let lines = buf.push(b"1}\ndata: [DONE]\n");
        assert_eq!(lines, vec!["data: {\"a\":1}", "data: [DONE]"]);
    }

    #[test]
    fn crlf_is_stripped() {
        let mut buf = LineBuffer::new();
        let lines = buf.push(b"event: message_start\r\n");
        assert_eq!(
            parse_sse_line(&lines[0]),
            Some(SseLine::Event("message_start".into()))
        );
    }

    #[test]
    fn done_is_recognized() {
        assert_eq!(parse_sse_line("data: [DONE]"), Some(SseLine::Done));
    }

    #[test]
    fn comment_lines_are_ignored() {
        assert_eq!(parse_sse_line(": keep-alive"), None);
    }

    #[test]
    fn remainder_is_final_partial_line() {
        let mut buf = LineBuffer::new();
        buf.push(b"data: tail-without-newline");
        assert_eq!(
            buf.take_remainder().as_deref(),
            Some("data: tail-without-newline")
        );
        assert_eq!(buf.take_remainder(), None);
    }
}
