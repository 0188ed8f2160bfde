//! Chunk coalescing for streaming turns.
//!
//! Providers can emit dozens of chunks per second; applying each one to the
//! node (and notifying observers) would be an update storm. The batcher
//! accumulates deltas and releases them once the flush window has elapsed.

use std::time::{Duration, Instant};

use crate::client::StreamChunk;

#[derive(Debug)]
pub struct ChunkBatcher {
    window: Duration,
    text: String,
    reasoning: String,
    last_flush: Instant,
}

/// Accumulated deltas released by one flush.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Flush {
    pub text: String,
    pub reasoning: String,
}

impl ChunkBatcher {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            text: String::new(),
            reasoning: String::new(),
            last_flush: Instant::now(),
        }
    }

    pub fn push(&mut self, chunk: &StreamChunk) {
        if let Some(delta) = &chunk.text_delta {
            self.text.push_str(delta);
        }
        if let Some(delta) = &chunk.reasoning_delta {
            self.reasoning.push_str(delta);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.reasoning.is_empty()
    }

    /// True once buffered content has waited out the flush window.
    pub fn due(&self) -> bool {
        !self.is_empty() && self.last_flush.elapsed() >= self.window
    }

    /// Drain the buffer, resetting the window. Returns `None` when there is
    /// nothing to apply.
    pub fn take(&mut self) -> Option<Flush> {
        if self.is_empty() {
            return None;
        }
        self.last_flush = Instant::now();
        Some(Flush {
            text: std::mem::take(&mut self.text),
            reasoning: std::mem::take(&mut self.reasoning),
        })
    }
}
