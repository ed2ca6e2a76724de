//! Results flowing from handlers back into the queue.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::HandlerError;

/// Successful handler output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub result: serde_json::Value,
    /// Some of the work succeeded; recorded as `partial_success`.
    #[serde(default)]
    pub partial: bool,
}

impl TaskOutput {
    pub fn complete(result: serde_json::Value) -> Self {
        Self {
            result,
            partial: false,
        }
    }

    pub fn partial(result: serde_json::Value) -> Self {
        Self {
            result,
            partial: true,
        }
    }
}

/// What a worker reports to [`QueueManager::complete`](super::QueueManager::complete).
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Succeeded(TaskOutput),
    Failed(HandlerError),
}

impl From<Result<TaskOutput, HandlerError>> for TaskOutcome {
    fn from(result: Result<TaskOutput, HandlerError>) -> Self {
        match result {
            Ok(output) => TaskOutcome::Succeeded(output),
            Err(err) => TaskOutcome::Failed(err),
        }
    }
}

/// What `complete()` did with the in-flight task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// Terminal success (`partial` for `partial_success`).
    Completed { partial: bool },
    /// Scheduled for another attempt after `delay`.
    Retrying { retry_count: u32, delay: Duration },
    /// Moved to the dead-letter store.
    DeadLettered { retry_count: u32 },
    /// The task was not in flight: already completed, reaped, or never dequeued.
    NotInFlight,
}

impl CompletionOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            CompletionOutcome::Completed { partial: false } => "completed",
            CompletionOutcome::Completed { partial: true } => "partial_success",
            CompletionOutcome::Retrying { .. } => "retrying",
            CompletionOutcome::DeadLettered { .. } => "dead_lettered",
            CompletionOutcome::NotInFlight => "not_in_flight",
        }
    }
}
