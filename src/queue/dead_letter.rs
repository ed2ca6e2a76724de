//! Dead-letter entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::envelope::TaskEnvelope;

/// A task that exhausted its retries, kept for operator inspection or replay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeadLetterEntry {
    /// The envelope exactly as it was on its last attempt.
    pub envelope: TaskEnvelope,
    pub final_error: String,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn new(
        envelope: TaskEnvelope,
        final_error: impl Into<String>,
        failed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            envelope,
            final_error: final_error.into(),
            failed_at,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.envelope.task_id
    }

    /// The envelope to re-enqueue on replay: same identity, fresh retry budget.
    pub fn replay_envelope(&self) -> TaskEnvelope {
        let mut envelope = self.envelope.clone();
        envelope.retry_count = 0;
        envelope
    }
}
