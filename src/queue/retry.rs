//! Retry policy and the retry/dead-letter decision.

use std::time::Duration;

use super::envelope::TaskEnvelope;

/// Exponential backoff for failed tasks.
///
/// The delay before retry number `n` (1-based) is
/// `min(max_delay, base_delay * 2^(n-1))`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// Delay before retry number `retry_count` (1-based; 0 is treated as 1).
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        // 2^30 already dwarfs any sane cap.
        let exponent = retry_count.saturating_sub(1).min(30);
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Decides what happens to an envelope whose current attempt failed.
    ///
    /// A non-retryable failure, or a failure with the retry budget already
    /// spent, dead-letters the envelope unchanged. Otherwise the returned
    /// envelope carries the incremented `retry_count`.
    pub fn decide(&self, envelope: &TaskEnvelope, retryable: bool) -> FailureAction {
        if retryable && envelope.can_retry() {
            let mut next = envelope.clone();
            next.retry_count += 1;
            let delay = self.delay_for(next.retry_count);
            FailureAction::Retry {
                envelope: next,
                delay,
            }
        } else {
            FailureAction::DeadLetter {
                envelope: envelope.clone(),
            }
        }
    }
}

/// Outcome of applying the retry policy to a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureAction {
    /// Re-enqueue `envelope` once `delay` has elapsed.
    Retry {
        envelope: TaskEnvelope,
        delay: Duration,
    },
    /// Move `envelope` to the dead-letter store.
    DeadLetter { envelope: TaskEnvelope },
}
