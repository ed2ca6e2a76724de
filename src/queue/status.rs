//! Status Records: the polling side channel.
//!
//! A Status Record is stored as a flat field map keyed by `job_id`. Every write
//! is a merge (fields not mentioned are preserved) followed by a TTL refresh, so
//! producer and worker writes never clobber each other's fields.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::envelope::TaskEnvelope;

const FIELD_JOB_ID: &str = "job_id";
const FIELD_TASK_ID: &str = "task_id";
const FIELD_STATUS: &str = "status";
const FIELD_OWNER_ID: &str = "owner_id";
const FIELD_TASK_TYPE: &str = "task_type";
const FIELD_CREATED_AT: &str = "created_at";
const FIELD_STARTED_AT: &str = "started_at";
const FIELD_COMPLETED_AT: &str = "completed_at";
const FIELD_RESULT: &str = "result";
const FIELD_ERROR: &str = "error";
const FIELD_LAST_ERROR: &str = "last_error";
const FIELD_WORKER_ID: &str = "worker_id";
const FIELD_RETRY_COUNT: &str = "retry_count";
const FIELD_NEXT_ATTEMPT_AT: &str = "next_attempt_at";
const DETAIL_PREFIX: &str = "detail:";

/// Lifecycle state of a job as seen by polling clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Processing,
    Completed,
    Failed,
    PartialSuccess,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::PartialSuccess => "partial_success",
        }
    }

    /// Terminal states never change again (short of an operator replay).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::PartialSuccess
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobState::Queued),
            "processing" => Ok(JobState::Processing),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "partial_success" => Ok(JobState::PartialSuccess),
            other => Err(format!("unknown job state '{}'", other)),
        }
    }
}

/// Current view of one job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusRecord {
    pub job_id: String,
    pub task_id: Option<String>,
    pub status: JobState,
    pub owner_id: Option<String>,
    pub task_type: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Present once the job completed (fully or partially).
    pub result: Option<serde_json::Value>,
    /// Present once the job failed permanently.
    pub error: Option<String>,
    /// Failure of the previous attempt while a retry is pending.
    pub last_error: Option<String>,
    pub worker_id: Option<String>,
    pub retry_count: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Task-type-specific display fields.
    pub details: BTreeMap<String, String>,
}

impl StatusRecord {
    /// Rebuilds a record from its stored fields.
    ///
    /// Returns `None` when the map has no recognisable `status`.
    pub fn from_fields(job_id: &str, fields: &HashMap<String, String>) -> Option<Self> {
        let status = fields.get(FIELD_STATUS)?.parse::<JobState>().ok()?;
        let text = |key: &str| fields.get(key).cloned();
        let time = |key: &str| {
            fields
                .get(key)
                .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
                .map(|t| t.with_timezone(&Utc))
        };

        let details = fields
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(DETAIL_PREFIX)
                    .map(|name| (name.to_string(), v.clone()))
            })
            .collect();

        Some(Self {
            job_id: fields
                .get(FIELD_JOB_ID)
                .cloned()
                .unwrap_or_else(|| job_id.to_string()),
            task_id: text(FIELD_TASK_ID),
            status,
            owner_id: text(FIELD_OWNER_ID),
            task_type: text(FIELD_TASK_TYPE),
            created_at: time(FIELD_CREATED_AT),
            started_at: time(FIELD_STARTED_AT),
            completed_at: time(FIELD_COMPLETED_AT),
            result: fields
                .get(FIELD_RESULT)
                .and_then(|raw| serde_json::from_str(raw).ok()),
            error: text(FIELD_ERROR),
            last_error: text(FIELD_LAST_ERROR),
            worker_id: text(FIELD_WORKER_ID),
            retry_count: fields
                .get(FIELD_RETRY_COUNT)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            next_attempt_at: time(FIELD_NEXT_ATTEMPT_AT),
            details,
        })
    }

    /// Reads just the creation time from stored fields (used by cleanup).
    pub(crate) fn created_at_of(fields: &HashMap<String, String>) -> Option<DateTime<Utc>> {
        fields
            .get(FIELD_CREATED_AT)
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|t| t.with_timezone(&Utc))
    }
}

/// A partial Status Record write.
///
/// Fields in `set` overwrite, fields in `remove` are deleted, everything else
/// is preserved.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusUpdate {
    set: Vec<(String, String)>,
    remove: Vec<String>,
}

impl StatusUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initial record written at enqueue time (also used on dead-letter replay).
    pub fn queued(envelope: &TaskEnvelope) -> Self {
        let mut update = Self::new()
            .field(FIELD_JOB_ID, &envelope.job_id)
            .field(FIELD_TASK_ID, &envelope.task_id)
            .state(JobState::Queued)
            .field(FIELD_OWNER_ID, &envelope.owner_id)
            .field(FIELD_TASK_TYPE, envelope.kind().as_str())
            .time(FIELD_CREATED_AT, envelope.created_at)
            .field(FIELD_RETRY_COUNT, envelope.retry_count.to_string())
            .clear(FIELD_STARTED_AT)
            .clear(FIELD_COMPLETED_AT)
            .clear(FIELD_RESULT)
            .clear(FIELD_ERROR)
            .clear(FIELD_LAST_ERROR)
            .clear(FIELD_WORKER_ID)
            .clear(FIELD_NEXT_ATTEMPT_AT);
        for (name, value) in envelope.task.status_echo() {
            update = update.detail(name, value);
        }
        update
    }

    pub fn processing(worker_id: &str, started_at: DateTime<Utc>, retry_count: u32) -> Self {
        Self::new()
            .state(JobState::Processing)
            .field(FIELD_WORKER_ID, worker_id)
            .time(FIELD_STARTED_AT, started_at)
            .field(FIELD_RETRY_COUNT, retry_count.to_string())
            .clear(FIELD_NEXT_ATTEMPT_AT)
    }

    pub fn completed(result: &serde_json::Value, partial: bool, at: DateTime<Utc>) -> Self {
        let state = if partial {
            JobState::PartialSuccess
        } else {
            JobState::Completed
        };
        Self::new()
            .state(state)
            .field(FIELD_RESULT, result.to_string())
            .time(FIELD_COMPLETED_AT, at)
            .clear(FIELD_ERROR)
            .clear(FIELD_NEXT_ATTEMPT_AT)
    }

    /// Failed attempt that will be retried at `next_attempt_at`.
    pub fn retrying(error: &str, retry_count: u32, next_attempt_at: DateTime<Utc>) -> Self {
        Self::new()
            .state(JobState::Queued)
            .field(FIELD_LAST_ERROR, error)
            .field(FIELD_RETRY_COUNT, retry_count.to_string())
            .time(FIELD_NEXT_ATTEMPT_AT, next_attempt_at)
    }

    /// Permanent failure.
    pub fn failed(error: &str, retry_count: u32, at: DateTime<Utc>) -> Self {
        Self::new()
            .state(JobState::Failed)
            .field(FIELD_ERROR, error)
            .field(FIELD_RETRY_COUNT, retry_count.to_string())
            .time(FIELD_COMPLETED_AT, at)
            .clear(FIELD_RESULT)
            .clear(FIELD_NEXT_ATTEMPT_AT)
    }

    pub fn state(self, state: JobState) -> Self {
        self.field(FIELD_STATUS, state.as_str())
    }

    pub fn field(mut self, name: &str, value: impl Into<String>) -> Self {
        self.remove.retain(|f| f != name);
        self.set.push((name.to_string(), value.into()));
        self
    }

    /// Task-type-specific display field.
    pub fn detail(self, name: &str, value: impl Into<String>) -> Self {
        let key = format!("{}{}", DETAIL_PREFIX, name);
        self.field(&key, value)
    }

    pub fn clear(mut self, name: &str) -> Self {
        self.set.retain(|(f, _)| f != name);
        self.remove.push(name.to_string());
        self
    }

    fn time(self, name: &str, at: DateTime<Utc>) -> Self {
        self.field(name, at.to_rfc3339())
    }

    pub fn fields_to_set(&self) -> &[(String, String)] {
        &self.set
    }

    pub fn fields_to_remove(&self) -> &[String] {
        &self.remove
    }
}
