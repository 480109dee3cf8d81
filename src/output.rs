//! Output handling and buffering for project logs.
//!
//! This module provides the per-project ring buffer of captured lines (`LogBuffer`),
//! the stream reader that splits child output into lines, and text sanitization.

use std::collections::VecDeque;

use chrono::Local;
use strip_ansi_escapes::strip;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

/// Default number of lines retained per project.
pub const DEFAULT_MAX_LINES: usize = 1000;

/// A single captured line of output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    /// The content of the line, including its trailing newline if one was read.
    pub text: String,
    /// Local time-of-day the line was captured.
    pub timestamp: String,
}

impl LogLine {
    /// Creates a line stamped with the current local time.
    pub fn now(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            timestamp: local_timestamp(),
        }
    }
}

/// A fixed-capacity ring buffer for storing `LogLine`s.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    max_lines: usize,
    lines: VecDeque<LogLine>,
}

impl LogBuffer {
    /// Creates a new `LogBuffer` with the specified maximum capacity.
    pub fn new(max_lines: usize) -> Self {
        Self {
            max_lines,
            lines: VecDeque::with_capacity(max_lines.min(1024)),
        }
    }

    /// Adds a line to the buffer, evicting the oldest lines beyond capacity.
    pub fn push(&mut self, line: LogLine) {
        self.lines.push_back(line);
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
        }
    }

    /// Returns the number of lines currently in the buffer.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Removes every line.
    pub fn clear(&mut self) {
        self.lines.clear();
    }

    /// Returns an iterator over the lines in the buffer, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &LogLine> {
        self.lines.iter()
    }

    /// Returns up to `count` of the most recent lines, oldest first.
    pub fn tail(&self, count: usize) -> Vec<LogLine> {
        let skip = self.lines.len().saturating_sub(count);
        self.lines.iter().skip(skip).cloned().collect()
    }
}

/// Sanitizes text for display, optionally stripping ANSI escape codes.
///
/// If `strip_ansi` is true, ANSI codes are removed. Invalid UTF-8 sequences are replaced.
pub fn sanitize_text(text: &str, strip_ansi: bool) -> String {
    if !strip_ansi {
        return text.to_string();
    }
    let stripped = strip(text.as_bytes());
    String::from_utf8_lossy(&stripped).to_string()
}

/// Local time-of-day, e.g. `3:04:05 PM`.
pub fn local_timestamp() -> String {
    Local::now().format("%-I:%M:%S %p").to_string()
}

/// Reads `reader` to EOF, handing every newline-terminated line to `sink`.
///
/// A trailing fragment without a newline is delivered as its own line. Invalid UTF-8
/// is replaced rather than ending the stream.
pub async fn read_lines<R, F>(reader: R, strip_ansi: bool, mut sink: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(String),
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                sink(sanitize_text(&text, strip_ansi));
            }
            Err(err) => {
                tracing::debug!("output stream closed: {}", err);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(text: &str) -> LogLine {
        LogLine {
            text: text.into(),
            timestamp: "12:00:00 PM".into(),
        }
    }

    #[test]
    fn log_buffer_drops_oldest() {
        let mut buffer = LogBuffer::new(2);
        buffer.push(line("a"));
        buffer.push(line("b"));
        buffer.push(line("c"));
        assert_eq!(buffer.len(), 2);
        let lines = buffer.iter().map(|l| l.text.clone()).collect::<Vec<_>>();
        assert_eq!(lines, vec!["b", "c"]);
    }

    #[test]
    fn keeps_most_recent_thousand() {
        let mut buffer = LogBuffer::new(DEFAULT_MAX_LINES);
        for i in 0..1001 {
            buffer.push(line(&i.to_string()));
        }
        assert_eq!(buffer.len(), 1000);
        let texts = buffer.iter().map(|l| l.text.as_str()).collect::<Vec<_>>();
        assert_eq!(texts.first(), Some(&"1"));
        assert_eq!(texts.last(), Some(&"1000"));
        assert!(texts
            .windows(2)
            .all(|pair| pair[0].parse::<u32>().unwrap() + 1 == pair[1].parse::<u32>().unwrap()));
    }

    #[test]
    fn tail_and_clear() {
        let mut buffer = LogBuffer::new(10);
        for text in ["a", "b", "c"] {
            buffer.push(line(text));
        }
        let tail = buffer.tail(2);
        assert_eq!(tail, vec![line("b"), line("c")]);
        assert_eq!(buffer.tail(50).len(), 3);
        buffer.clear();
        assert!(buffer.is_empty());
    }

    #[test]
    fn strips_ansi_when_requested() {
        let colored = "\u{1b}[32mready\u{1b}[0m\n";
        assert_eq!(sanitize_text(colored, true), "ready\n");
        assert_eq!(sanitize_text(colored, false), colored);
    }

    #[tokio::test]
    async fn read_lines_splits_on_newlines() {
        let input: &[u8] = b"first\nsecond\r\npartial";
        let mut seen = Vec::new();
        read_lines(input, false, |text| seen.push(text)).await;
        assert_eq!(seen, vec!["first\n", "second\r\n", "partial"]);
    }

    #[tokio::test]
    async fn read_lines_survives_invalid_utf8() {
        let input: &[u8] = b"ok\n\xff\xfe\nafter\n";
        let mut seen = Vec::new();
        read_lines(input, false, |text| seen.push(text)).await;
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[2], "after\n");
    }
}
