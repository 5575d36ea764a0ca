//! Reassembly of newline-delimited records from an unstructured byte stream.
//!
//! Worker stdout arrives in arbitrary chunks; a record may be split across
//! any number of them. The framer keeps the trailing partial line buffered
//! until its terminating `\n` arrives. Each byte is scanned for a terminator
//! once, however many chunks a line spans.

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::Result;

/// Upper bound on a single buffered line (16 MiB).
pub const DEFAULT_MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// Incremental newline splitter.
#[derive(Debug)]
pub struct LineFramer {
    buf: Vec<u8>,
    /// Prefix of `buf` already known to hold no `\n`.
    scanned: usize,
    max_line_bytes: usize,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl LineFramer {
    /// Create a framer with the default line limit.
    pub const fn new() -> Self {
        Self::with_max_line_bytes(DEFAULT_MAX_LINE_BYTES)
    }

    /// Create a framer that discards partial lines longer than `max_line_bytes`.
    pub const fn with_max_line_bytes(max_line_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            scanned: 0,
            max_line_bytes,
        }
    }

    /// Append a chunk and return every line it completed.
    ///
    /// A trailing `\r` is trimmed from each line. Blank lines and lines that
    /// are not valid UTF-8 are skipped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        let mut from = self.scanned;
        while let Some(offset) = memchr::memchr(b'\n', &self.buf[from..]) {
            let end = from + offset;
            if let Some(line) = decode_line(&self.buf[start..end]) {
                lines.push(line);
            }
            start = end + 1;
            from = start;
        }
        if start > 0 {
            self.buf.drain(..start);
        }
        self.scanned = self.buf.len();

        if self.buf.len() > self.max_line_bytes {
            warn!(
                buffered = self.buf.len(),
                max = self.max_line_bytes,
                "Discarding oversized partial line"
            );
            self.buf.clear();
            self.scanned = 0;
        }

        lines
    }

    /// Flush whatever is buffered as a final line (used at end of stream).
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buf);
        self.scanned = 0;
        decode_line(&rest)
    }

    /// Number of bytes waiting for a line terminator.
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }
}

fn decode_line(raw: &[u8]) -> Option<String> {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    match std::str::from_utf8(raw) {
        Ok(line) if line.trim().is_empty() => None,
        Ok(line) => Some(line.to_string()),
        Err(e) => {
            debug!(error = %e, bytes = raw.len(), "Dropping line with invalid UTF-8");
            None
        }
    }
}

/// Parse one complete line as a JSON value.
pub fn parse_line(line: &str) -> Result<Value> {
    Ok(serde_json::from_str(line)?)
}

/// Serialize a JSON value as one NDJSON record, newline included.
pub fn encode_line(value: &Value) -> Result<String> {
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    Ok(line)
}
