//! Line framing for progress channels
//!
//! ```text
//! {"summary": {...}}            progress update
//! data: {"summary": {...}}      progress update
//! event: complete               the next data line completes the task
//! data: {"overall_progress": 1}
//! event: error                  the next data line fails the task
//! data: {"message": "boom"}
//! : keep-alive                  comment, ignored
//! ```
//!
//! A named event followed by a blank line instead of `data:` fires with no
//! payload. A line longer than [`MAX_LINE_BYTES`] is dropped up to its
//! newline.

use serde_json::Value;
use tracing::debug;

use switchboard_core::{Error, ProgressStreamData, ProgressSummary, Result};

pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// One decoded signal from a progress channel
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressFrame {
    Update(ProgressStreamData),
    /// Completion, with a final summary when the server sent one
    Complete(Option<ProgressSummary>),
    /// Server-reported failure message
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventName {
    Progress,
    Complete,
    Error,
    Unknown,
}

impl EventName {
    fn parse(name: &str) -> Self {
        match name.trim() {
            "progress" | "message" => EventName::Progress,
            "complete" => EventName::Complete,
            "error" => EventName::Error,
            _ => EventName::Unknown,
        }
    }
}

/// Incremental decoder; feed it raw chunks or whole lines
#[derive(Debug, Default)]
pub struct FrameDecoder {
    pending_event: Option<EventName>,
    partial: Vec<u8>,
    /// Skipping the rest of an oversized line
    overflowed: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes; returns every frame completed by it. A trailing
    /// partial line is kept until the next chunk.
    pub fn push_bytes(&mut self, mut chunk: &[u8]) -> Vec<Result<ProgressFrame>> {
        let mut frames = Vec::new();
        if self.overflowed {
            match chunk.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    chunk = &chunk[pos + 1..];
                    self.overflowed = false;
                }
                None => return frames,
            }
        }

        self.partial.extend_from_slice(chunk);
        while let Some(pos) = self.partial.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.partial.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]);
            if let Some(frame) = self.push_line(&line).transpose() {
                frames.push(frame);
            }
        }

        if self.partial.len() > MAX_LINE_BYTES {
            self.partial.clear();
            self.pending_event = None;
            self.overflowed = true;
            frames.push(Err(Error::Parse(format!(
                "progress line longer than {} bytes",
                MAX_LINE_BYTES
            ))));
        }
        frames
    }

    /// End of input: decode an unterminated last line, then fire a named
    /// event still waiting for its blank line.
    pub fn finish(&mut self) -> Vec<Result<ProgressFrame>> {
        let mut frames = Vec::new();
        if !self.overflowed && !self.partial.is_empty() {
            let rest = std::mem::take(&mut self.partial);
            if let Some(frame) = self.push_line(&String::from_utf8_lossy(&rest)).transpose() {
                frames.push(frame);
            }
        }
        self.partial.clear();
        self.overflowed = false;
        if let Some(frame) = self.push_line("").transpose() {
            frames.push(frame);
        }
        frames
    }

    /// Feed one line (without its newline)
    pub fn push_line(&mut self, line: &str) -> Result<Option<ProgressFrame>> {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if line.trim().is_empty() {
            return Ok(self.pending_event.take().and_then(|name| match name {
                EventName::Complete => Some(ProgressFrame::Complete(None)),
                EventName::Error => Some(ProgressFrame::Error("unspecified error".to_string())),
                EventName::Progress | EventName::Unknown => None,
            }));
        }
        if line.starts_with(':') {
            return Ok(None);
        }
        if let Some(name) = field(line, "event") {
            self.pending_event = Some(EventName::parse(name));
            return Ok(None);
        }
        if let Some(payload) = field(line, "data") {
            let name = self.pending_event.take().unwrap_or(EventName::Progress);
            return decode_payload(name, payload);
        }
        if line.trim_start().starts_with('{') {
            return decode_payload(EventName::Progress, line);
        }

        // id:, retry: and anything else unrecognized
        debug!("Ignoring progress line: {}", line);
        Ok(None)
    }
}

/// `name: value` or `name:value`
fn field<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(name)?.strip_prefix(':')?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

fn decode_payload(name: EventName, payload: &str) -> Result<Option<ProgressFrame>> {
    match name {
        EventName::Progress => {
            let data: ProgressStreamData = serde_json::from_str(payload)
                .map_err(|e| Error::Parse(format!("invalid progress payload: {}", e)))?;
            Ok(Some(ProgressFrame::Update(data)))
        }
        EventName::Complete => Ok(Some(ProgressFrame::Complete(completion_summary(payload)))),
        EventName::Error => Ok(Some(ProgressFrame::Error(error_message(payload)))),
        EventName::Unknown => {
            debug!("Ignoring data for unknown progress event");
            Ok(None)
        }
    }
}

/// A completion payload may be a full stream datum or a bare summary
fn completion_summary(payload: &str) -> Option<ProgressSummary> {
    let value: Value = serde_json::from_str(payload).ok()?;
    let summary = match value.get("summary") {
        Some(inner) => inner.clone(),
        None => value,
    };
    serde_json::from_value(summary).ok()
}

fn error_message(payload: &str) -> String {
    match serde_json::from_str::<Value>(payload) {
        Ok(value) => ["message", "error"]
            .iter()
            .find_map(|key| value.get(*key).and_then(|v| v.as_str()).map(str::to_string))
            .unwrap_or_else(|| payload.trim().to_string()),
        Err(_) => payload.trim().to_string(),
    }
}
