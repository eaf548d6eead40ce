//! Buffer for remote ICE candidates that arrived too early.
//!
//! The relay gives no cross-event ordering guarantee: an `ice-candidate`
//! may be delivered before the `offer`/`answer` it relates to, and a
//! candidate cannot be applied until a remote description is set. Early
//! candidates are queued here and drained exactly once, in arrival
//! order, immediately after the remote description is accepted.

use std::collections::VecDeque;

/// FIFO queue of not-yet-applicable remote candidates (JSON strings).
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    queue: VecDeque<String>,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a candidate that cannot be applied yet.
    pub fn push(&mut self, candidate: String) {
        self.queue.push_back(candidate);
    }

    /// Take every buffered candidate, oldest first, leaving the buffer
    /// empty. Callers apply the returned candidates before touching any
    /// newly arriving one (the session loop runs each handler to
    /// completion, so nothing can interleave).
    pub fn drain(&mut self) -> Vec<String> {
        self.queue.drain(..).collect()
    }

    /// Discard everything (session teardown).
    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
