//! Producer-side helpers used by API handlers.
//!
//! A [`Producer`] submits envelopes to a queue and, when configured with an
//! executor, runs the task inline if the store cannot be reached. Polling
//! clients use [`Producer::wait_for_terminal`] to block until a job settles.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::QueueError;
use crate::queue::{QueueManager, StatusRecord, StatusUpdate, TaskEnvelope};
use crate::worker::{dispatch, HandlerResult, TaskExecutor};

/// Where a submitted task ended up.
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// On the queue; poll the Status Record for `job_id`.
    Queued { job_id: String },
    /// The store was unreachable and the task already ran in the caller's process.
    Inline(HandlerResult),
}

/// Submits tasks to one queue.
pub struct Producer {
    queue: Arc<QueueManager>,
    fallback: Option<Arc<dyn TaskExecutor>>,
}

impl Producer {
    /// Creates a producer without inline fallback: an unreachable store is an error.
    pub fn new(queue: Arc<QueueManager>) -> Self {
        Self {
            queue,
            fallback: None,
        }
    }

    /// Runs tasks inline through `executor` when the store is unreachable.
    pub fn with_inline_fallback(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.fallback = Some(executor);
        self
    }

    pub fn queue(&self) -> &Arc<QueueManager> {
        &self.queue
    }

    /// Enqueues `envelope`, falling back to inline execution on transient store failures.
    ///
    /// Only store unavailability triggers the fallback. A full queue or a
    /// serialization failure is returned as an error so the caller can
    /// surface it.
    pub async fn submit(&self, envelope: TaskEnvelope) -> Result<Submission, QueueError> {
        let job_id = envelope.job_id.clone();
        let mut inline = envelope.clone();

        match self.queue.enqueue(envelope).await {
            Ok(()) => Ok(Submission::Queued { job_id }),
            Err(err) if err.is_transient() => {
                let Some(executor) = &self.fallback else {
                    return Err(err);
                };
                warn!(
                    queue = %self.queue.queue_name(),
                    job_id = %job_id,
                    task_type = %inline.kind(),
                    error = %err,
                    "Queue store unreachable, running task inline"
                );
                inline.created_at = self.queue.now();
                let result = dispatch(executor.as_ref(), &inline.task).await;
                info!(
                    job_id = %job_id,
                    success = result.is_ok(),
                    "Inline task finished"
                );
                self.record_inline_status(&inline, &result).await;
                Ok(Submission::Inline(result))
            }
            Err(err) => Err(err),
        }
    }

    /// Writes the terminal Status Record of a task that ran inline.
    ///
    /// Best-effort: the store may still be down, in which case polling
    /// clients find no record rather than a stale one.
    async fn record_inline_status(&self, envelope: &TaskEnvelope, result: &HandlerResult) {
        let now = self.queue.now();
        let terminal = match result {
            Ok(output) => StatusUpdate::completed(&output.result, output.partial, now),
            Err(err) => StatusUpdate::failed(&err.message, envelope.retry_count, now),
        };
        let written = match self
            .queue
            .set_status(&envelope.job_id, StatusUpdate::queued(envelope))
            .await
        {
            Ok(()) => self.queue.set_status(&envelope.job_id, terminal).await,
            Err(err) => Err(err),
        };
        if let Err(err) = written {
            warn!(
                job_id = %envelope.job_id,
                error = %err,
                "Failed to record inline task status"
            );
        }
    }

    /// Polls the Status Record of `job_id` every `interval` until it is terminal.
    ///
    /// A missing record is treated as not-yet-terminal; it may have been
    /// written by a producer that has not finished enqueueing.
    ///
    /// # Errors
    ///
    /// - `QueueError::WaitTimeout` once `give_up` has elapsed
    /// - `QueueError::Store` if a status read fails
    pub async fn wait_for_terminal(
        &self,
        job_id: &str,
        interval: Duration,
        give_up: Duration,
    ) -> Result<StatusRecord, QueueError> {
        let started = Instant::now();
        let deadline = started + give_up;

        loop {
            if let Some(record) = self.queue.get_status(job_id).await? {
                if record.status.is_terminal() {
                    return Ok(record);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(QueueError::WaitTimeout {
                    job_id: job_id.to_string(),
                    waited: now.duration_since(started),
                });
            }
            tokio::time::sleep(interval.min(deadline - now)).await;
        }
    }
}
