use serde::Deserialize;

/// A complete line read from a worker's diagnostic stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiagnosticLine {
    /// `{"type": "progress", "function": "..."}`
    Progress(String),
    /// Anything else; kept as error text.
    Text(String),
}

#[derive(Deserialize)]
struct ProgressNotification {
    #[serde(rename = "type")]
    kind: String,
    function: String,
}

/// Splits diagnostic-stream chunks into lines.
///
/// Bytes are buffered until a `\n` arrives, so a line split across reads is
/// only classified once it is complete. Non-progress lines accumulate into an
/// error-text buffer.
#[derive(Debug, Default)]
pub struct DiagnosticDecoder {
    pending: Vec<u8>,
    error_text: Vec<String>,
}

impl DiagnosticDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk and returns the lines it completed, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<DiagnosticLine> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(newline) = self.pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=newline).collect();
            lines.push(self.classify(&raw[..raw.len() - 1]));
        }
        lines
    }

    /// Flushes a trailing line that ended at end-of-stream without `\n`.
    pub fn finish(&mut self) -> Option<DiagnosticLine> {
        if self.pending.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.pending);
        Some(self.classify(&raw))
    }

    /// Accumulated non-progress text, trimmed.
    pub fn error_text(&self) -> String {
        self.error_text.join("\n").trim().to_string()
    }

    fn classify(&mut self, raw: &[u8]) -> DiagnosticLine {
        let text = String::from_utf8_lossy(raw);
        let line = text.strip_suffix('\r').unwrap_or(&text);

        if let Some(function) = parse_progress(line) {
            return DiagnosticLine::Progress(function);
        }

        self.error_text.push(line.to_string());
        DiagnosticLine::Text(line.to_string())
    }
}

fn parse_progress(line: &str) -> Option<String> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    match serde_json::from_str::<ProgressNotification>(trimmed) {
        Ok(notification) if notification.kind == "progress" => Some(notification.function),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_line_is_recognized() {
        let mut decoder = DiagnosticDecoder::new();
        let lines = decoder.push(b"{\"type\": \"progress\", \"function\": \"Calc.add\", \"status\": \"complete\"}\n");

        assert_eq!(lines, vec![DiagnosticLine::Progress("Calc.add".to_string())]);
        assert_eq!(decoder.error_text(), "");
    }

    #[test]
    fn test_line_split_across_chunks_is_parsed_once_complete() {
        let mut decoder = DiagnosticDecoder::new();

        assert!(decoder.push(b"{\"type\": \"prog").is_empty());
        assert!(decoder.push(b"ress\", \"function\": ").is_empty());
        let lines = decoder.push(b"\"add\"}\n{\"type\"");

        assert_eq!(lines, vec![DiagnosticLine::Progress("add".to_string())]);
        // The half line after the newline has not been classified yet.
        assert_eq!(decoder.error_text(), "");

        let lines = decoder.push(b": \"progress\", \"function\": \"sub\"}\n");
        assert_eq!(lines, vec![DiagnosticLine::Progress("sub".to_string())]);
    }

    #[test]
    fn test_traceback_accumulates_as_error_text() {
        let mut decoder = DiagnosticDecoder::new();
        decoder.push(b"Traceback (most recent call last):\n  File \"gen.py\", line 3\n");
        decoder.push(b"{\"type\": \"progress\", \"function\": \"a\"}\n");
        decoder.push(b"ValueError: boom\n");

        assert_eq!(
            decoder.error_text(),
            "Traceback (most recent call last):\n  File \"gen.py\", line 3\nValueError: boom"
        );
    }

    #[test]
    fn test_other_json_types_are_error_text() {
        let mut decoder = DiagnosticDecoder::new();
        let lines = decoder.push(b"{\"error\": \"Syntax error: bad indent\"}\n{\"type\": \"log\", \"function\": \"a\"}\n");

        assert!(matches!(lines[0], DiagnosticLine::Text(_)));
        assert!(matches!(lines[1], DiagnosticLine::Text(_)));
        assert!(decoder.error_text().contains("Syntax error"));
    }

    #[test]
    fn test_finish_flushes_unterminated_line() {
        let mut decoder = DiagnosticDecoder::new();
        assert!(decoder.push(b"fatal: model not found").is_empty());

        let last = decoder.finish();
        assert_eq!(last, Some(DiagnosticLine::Text("fatal: model not found".to_string())));
        assert_eq!(decoder.finish(), None);
        assert_eq!(decoder.error_text(), "fatal: model not found");
    }

    #[test]
    fn test_crlf_line_endings() {
        let mut decoder = DiagnosticDecoder::new();
        let lines = decoder.push(b"{\"type\":\"progress\",\"function\":\"f\"}\r\n");
        assert_eq!(lines, vec![DiagnosticLine::Progress("f".to_string())]);
    }
}
