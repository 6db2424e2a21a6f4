//! Newline-delimited JSON stream decoding
//!
//! Raw response chunks arrive with arbitrary boundaries. [`StreamState`]
//! buffers bytes until a full line is available, decodes each line as UTF-8
//! only once it is complete (so a multi-byte character split across chunks
//! survives), and turns each line into a [`StreamEvent`].

use serde_json::Value;

use super::response::stream_delta;
use super::traits::Completion;

/// What a single stream line meant
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamEvent {
    /// A non-empty delta
    Delta(String),
    /// The backend reported an error in-band
    Failed(String),
    /// The backend marked the end of the answer
    Done,
}

/// Per-request decoding state
#[derive(Debug, Default)]
pub struct StreamState {
    /// Bytes not yet consumed as complete lines
    buffer: Vec<u8>,
    /// Offset in `buffer` already scanned for a newline
    cursor: usize,
    /// Concatenated deltas
    answer: String,
    /// Whether a `done` event has been seen
    done: bool,
}

impl StreamState {
    /// Create an empty state
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a raw chunk, returning events for every line it completed
    pub fn push_bytes(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(line) = self.take_line() {
            if let Some(event) = self.handle_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Flush a trailing line that was never newline-terminated
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let rest = std::mem::take(&mut self.buffer);
        self.cursor = 0;
        self.handle_line(&rest).into_iter().collect()
    }

    /// Answer accumulated so far, untrimmed
    #[must_use]
    pub fn answer(&self) -> &str {
        &self.answer
    }

    /// Whether the backend has signalled the end of the answer
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Final trimmed answer
    #[must_use]
    pub fn into_completion(self) -> Completion {
        Completion::from_text(self.answer.trim())
    }

    fn take_line(&mut self) -> Option<Vec<u8>> {
        let offset = self.buffer[self.cursor..].iter().position(|&b| b == b'\n');
        match offset {
            Some(offset) => {
                let end = self.cursor + offset;
                let mut line: Vec<u8> = self.buffer.drain(..=end).collect();
                line.pop();
                self.cursor = 0;
                Some(line)
            }
            None => {
                self.cursor = self.buffer.len();
                None
            }
        }
    }

    fn handle_line(&mut self, line: &[u8]) -> Option<StreamEvent> {
        let line = String::from_utf8_lossy(line);
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let event: Value = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(e) => {
                tracing::debug!(error = %e, len = line.len(), "Skipping malformed stream line");
                return None;
            }
        };

        if let Some(error) = event.get("error").and_then(Value::as_str) {
            return Some(StreamEvent::Failed(error.to_string()));
        }

        let delta = stream_delta(&event);
        if !delta.is_empty() {
            self.answer.push_str(&delta);
            return Some(StreamEvent::Delta(delta));
        }

        if event.get("done").and_then(Value::as_bool).unwrap_or(false) {
            self.done = true;
            return Some(StreamEvent::Done);
        }

        None
    }
}
