//! Response batch completion detection
//!
//! The protocol has no explicit end-of-response marker that every server
//! honours, so a batch is judged complete by a mix of signals: a `done`
//! status, an expected message count, or a quiet period whose length adapts
//! to the traffic seen so far.

use std::time::Duration;

use rv_core::CompletionPolicy;
use rv_protocol::Message;

/// Smallest window used after a non-output message
const MIN_WIDENED_WINDOW: Duration = Duration::from_millis(5);

/// Growth factor applied to the window after a non-output message
const WIDEN_FACTOR: u32 = 4;

/// Tracks one response batch and decides when it is complete
#[derive(Debug, Clone)]
pub struct CompletionDetector {
    policy: CompletionPolicy,
    window: Duration,
    seen: usize,
}

impl CompletionDetector {
    /// Create a detector for a fresh batch
    pub fn new(policy: CompletionPolicy) -> Self {
        let window = match policy {
            CompletionPolicy::Adaptive { floor, .. } => floor,
            _ => Duration::ZERO,
        };

        Self {
            policy,
            window,
            seen: 0,
        }
    }

    /// Record a message; returns true when the batch is complete
    pub fn observe(&mut self, message: &Message) -> bool {
        self.seen += 1;

        match self.policy {
            CompletionPolicy::Expect(count) => self.seen >= count || message.is_exception(),
            CompletionPolicy::UntilDone => message.is_done(),
            CompletionPolicy::Adaptive { floor, ceiling } => {
                if message.is_done() {
                    return true;
                }

                self.window = if message.has_output() {
                    // More output is likely imminent
                    (self.window / WIDEN_FACTOR).max(floor)
                } else {
                    (self.window * WIDEN_FACTOR)
                        .max(MIN_WIDENED_WINDOW)
                        .min(ceiling)
                };
                false
            }
        }
    }

    /// How long to wait for the next message
    ///
    /// `None` means wait up to the hard ceiling: either nothing has arrived
    /// yet or the policy does not use a quiet window.
    pub fn next_wait(&self) -> Option<Duration> {
        match self.policy {
            CompletionPolicy::Adaptive { .. } if self.seen > 0 => Some(self.window),
            _ => None,
        }
    }

    /// Number of messages observed so far
    pub fn seen(&self) -> usize {
        self.seen
    }
}
