//! Incremental utterance assembly.
//!
//! The vendor streams each spoken utterance as numbered text fragments and
//! closes it with a terminal signal. Fragments are appended in arrival order;
//! the text only becomes visible to the conversation once the terminal signal
//! flushes the buffer.

use crate::conversation::error::ControllerError;
use crate::conversation::turn::Speaker;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct UtteranceBuffer {
    speaker: Speaker,
    text: String,
    next_sequence: u64,
    last_activity: Option<Instant>,
    stall_reported: bool,
}

impl UtteranceBuffer {
    pub fn new(speaker: Speaker) -> Self {
        Self {
            speaker,
            text: String::new(),
            next_sequence: 0,
            last_activity: None,
            stall_reported: false,
        }
    }

    /// An utterance is open from its first fragment until it is flushed.
    pub fn is_open(&self) -> bool {
        self.last_activity.is_some()
    }

    /// Text received so far, for live captions.
    pub fn partial(&self) -> &str {
        &self.text
    }

    pub fn is_stalled(&self) -> bool {
        self.stall_reported
    }

    /// Append fragment `sequence`. Gaps and duplicates are rejected untouched.
    pub fn push(&mut self, sequence: u64, fragment: &str, now: Instant) -> Result<(), ControllerError> {
        if sequence != self.next_sequence {
            return Err(ControllerError::ProtocolViolation {
                speaker: self.speaker,
                expected: self.next_sequence,
                received: sequence,
            });
        }

        self.text.push_str(fragment);
        self.next_sequence += 1;
        self.last_activity = Some(now);
        // A late fragment revives a stalled utterance.
        self.stall_reported = false;
        Ok(())
    }

    /// Close the utterance. Returns the trimmed text, or `None` when nothing
    /// (or only whitespace) was received.
    pub fn flush(&mut self) -> Option<String> {
        let text = std::mem::take(&mut self.text);
        self.reset();
        let text = text.trim();
        (!text.is_empty()).then(|| text.to_string())
    }

    pub fn reset(&mut self) {
        self.text.clear();
        self.next_sequence = 0;
        self.last_activity = None;
        self.stall_reported = false;
    }

    /// Report a stall once per silent period longer than `timeout`.
    pub fn check_stall(&mut self, now: Instant, timeout: Duration) -> Option<Duration> {
        let idle = now.saturating_duration_since(self.last_activity?);
        if self.stall_reported || idle <= timeout {
            return None;
        }
        self.stall_reported = true;
        Some(idle)
    }
}
