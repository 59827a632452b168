//! NDJSON frame buffer for subprocess stdout.
//!
//! The transport hands over raw byte chunks cut at arbitrary boundaries.
//! [`FrameBuffer`] stitches them back into newline-delimited JSON records,
//! releasing a [`Frame`] only once its text decodes as one complete JSON
//! value.
//!
//! # Speculative buffering
//!
//! A line that fails to decode because the input *ended early* (serde's EOF
//! error class) is kept, newline included, and retried with the next line.
//! This lets a document emitted across several physical lines still decode.
//! A line that fails with a hard syntax error can never become valid and is
//! skipped as a decode failure.
//!
//! # Overflow guard
//!
//! The buffer never holds more than `max_bytes` undecoded bytes. Crossing the
//! limit returns [`AppError::BufferOverflow`] and empties the buffer, so the
//! stream resynchronizes at the next newline instead of growing unbounded.

use serde_json::Value;
use tracing::{debug, warn};

use crate::AppError;

/// Default undecoded-byte limit: 1 MiB.
pub const DEFAULT_MAX_BUFFER_BYTES: usize = 1_048_576;

/// One complete newline-delimited JSON record.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Raw record text without the trailing newline.
    pub line: String,
    /// Decoded JSON value.
    pub value: Value,
}

/// Result of a single [`FrameBuffer::push`].
#[derive(Debug, Default)]
pub struct PushOutcome {
    /// Frames released by this push, in stream order.
    pub frames: Vec<Frame>,
    /// Set when the overflow guard tripped during this push.
    pub error: Option<AppError>,
    /// Number of records skipped as undecodable.
    pub skipped: usize,
}

/// Accumulates output chunks into complete JSON frames.
#[derive(Debug)]
pub struct FrameBuffer {
    /// Bytes after the last newline seen.
    partial: Vec<u8>,
    /// Complete lines that have not yet formed a valid document.
    pending: String,
    max_bytes: usize,
}

enum Attempt {
    Released(Frame),
    Incomplete,
    Invalid(serde_json::Error),
}

impl FrameBuffer {
    /// Create a buffer with the [`DEFAULT_MAX_BUFFER_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_bytes(DEFAULT_MAX_BUFFER_BYTES)
    }

    /// Create a buffer holding at most `max_bytes` undecoded bytes.
    #[must_use]
    pub fn with_max_bytes(max_bytes: usize) -> Self {
        Self {
            partial: Vec::new(),
            pending: String::new(),
            max_bytes: max_bytes.max(1),
        }
    }

    /// Configured undecoded-byte limit.
    #[must_use]
    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Number of undecoded bytes currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.partial.len() + self.pending.len()
    }

    /// Whether no undecoded bytes are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop everything buffered.
    pub fn reset(&mut self) {
        self.partial.clear();
        self.pending.clear();
    }

    /// Append `bytes` and release every frame that is now complete.
    pub fn push(&mut self, bytes: &[u8]) -> PushOutcome {
        let mut outcome = PushOutcome::default();
        let mut rest = bytes;

        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            self.partial.extend_from_slice(&rest[..pos]);
            rest = &rest[pos + 1..];

            if self.len() > self.max_bytes {
                self.overflow(&mut outcome);
                continue;
            }

            let raw = std::mem::take(&mut self.partial);
            self.accept_line(&raw, &mut outcome);
        }

        self.partial.extend_from_slice(rest);
        if self.len() > self.max_bytes {
            self.overflow(&mut outcome);
        }

        outcome
    }

    /// Flush whatever remains when the stream ends.
    ///
    /// A trailing record without its newline is still released if it decodes.
    pub fn finish(&mut self) -> PushOutcome {
        let mut outcome = PushOutcome::default();
        if !self.partial.is_empty() {
            let raw = std::mem::take(&mut self.partial);
            self.accept_line(&raw, &mut outcome);
        }
        if !self.pending.trim().is_empty() {
            warn!(
                bytes = self.pending.len(),
                "frame buffer: stream ended inside an incomplete record"
            );
            outcome.skipped += 1;
        }
        self.pending.clear();
        outcome
    }

    fn accept_line(&mut self, raw: &[u8], outcome: &mut PushOutcome) {
        let decoded = String::from_utf8_lossy(raw);
        let line: &str = decoded.strip_suffix('\r').unwrap_or(&decoded);

        if self.pending.is_empty() {
            if line.trim().is_empty() {
                return;
            }
            self.pending.push_str(line);
        } else {
            // Protocol records are single-line objects; one arriving whole
            // means the buffered fragment is stale and must not swallow it.
            if let Attempt::Released(frame) = try_decode(line) {
                if frame.value.is_object() {
                    let stale = std::mem::take(&mut self.pending);
                    skip_stale(&stale, outcome);
                    outcome.frames.push(frame);
                    return;
                }
            }
            self.pending.push('\n');
            self.pending.push_str(line);
        }

        match try_decode(&self.pending) {
            Attempt::Released(frame) => {
                self.pending.clear();
                outcome.frames.push(frame);
            }
            Attempt::Incomplete => {
                debug!(
                    bytes = self.pending.len(),
                    "frame buffer: record incomplete, buffering speculatively"
                );
            }
            Attempt::Invalid(err) => {
                let candidate = std::mem::take(&mut self.pending);
                skip(&candidate, &err, outcome);

                // The newest line may still open a record of its own.
                if candidate.len() > line.len() && matches!(try_decode(line), Attempt::Incomplete) {
                    self.pending.push_str(line);
                }
            }
        }
    }

    fn overflow(&mut self, outcome: &mut PushOutcome) {
        let held = self.len();
        warn!(
            held,
            limit = self.max_bytes,
            "frame buffer: undecoded output exceeded limit, resetting"
        );
        self.reset();
        outcome.error = Some(AppError::BufferOverflow(format!(
            "{held} undecoded bytes exceeded limit of {} bytes",
            self.max_bytes
        )));
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

fn try_decode(text: &str) -> Attempt {
    match serde_json::from_str::<Value>(text) {
        Ok(value) => Attempt::Released(Frame {
            line: text.to_owned(),
            value,
        }),
        Err(err) if err.is_eof() => Attempt::Incomplete,
        Err(err) => Attempt::Invalid(err),
    }
}

fn skip_stale(text: &str, outcome: &mut PushOutcome) {
    let preview: String = text.chars().take(120).collect();
    warn!(
        raw_line = %preview,
        "frame buffer: discarding incomplete record superseded by a complete one"
    );
    outcome.skipped += 1;
}

fn skip(text: &str, err: &serde_json::Error, outcome: &mut PushOutcome) {
    let preview: String = text.chars().take(120).collect();
    warn!(
        error = %AppError::Decode(err.to_string()),
        raw_line = %preview,
        "frame buffer: undecodable record, skipping"
    );
    outcome.skipped += 1;
}
