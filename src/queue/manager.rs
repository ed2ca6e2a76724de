//! The Queue Manager: the one façade producers, workers and operators use.
//!
//! Every envelope lives in exactly one place at a time:
//!
//! ```text
//! enqueue ──► pending ──dequeue──► claimed ──index──► processing
//!                ▲                    │                  │
//!                │   orphan recovery  │                  ├─ success ──► (gone)
//!                ├────────────────────┘                  ├─ retry ────► delayed
//!                │                                       └─ exhausted ► dead_letter
//!                ├──── promote_due ◄──── delayed
//!                └──── retry_dead_letter ◄──── dead_letter
//! ```
//!
//! Each arrow is one atomic backend step. Status Records and counters are a
//! side channel: their writes are best-effort once the envelope has moved.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::backend::{ListEnd, QueueBackend, RedisBackend, Transfer};
use super::dead_letter::DeadLetterEntry;
use super::envelope::{raw_is_priority, TaskEnvelope};
use super::keys::QueueKeys;
use super::outcome::{CompletionOutcome, TaskOutcome};
use super::retry::FailureAction;
use super::status::{StatusRecord, StatusUpdate};
use crate::clock::{Clock, SystemClock};
use crate::config::QueueConfig;
use crate::error::{QueueError, StoreError};
use crate::metrics::{MetricsCollector, QueueDepths};

/// Extra attempts for a durability operation that hit a transient store error.
const STORE_RETRIES: u32 = 3;

/// Delay before the first of those extra attempts; doubles each time.
const STORE_RETRY_BASE: Duration = Duration::from_millis(100);

/// Delay before the second connection attempt; doubles up to the configured cap.
const CONNECT_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Delayed entries moved per `promote_due` call.
const PROMOTE_BATCH: usize = 100;

/// Error recorded when the reaper takes a task back from a silent worker.
const VISIBILITY_TIMEOUT_ERROR: &str = "visibility timeout expired before the task was completed";

const COUNTER_QUEUED: &str = "queued";
const COUNTER_PROCESSING: &str = "processing";
const COUNTER_COMPLETED: &str = "completed";
const COUNTER_FAILED: &str = "failed";
const COUNTER_RETRIED: &str = "retried";
const COUNTER_DEAD_LETTERED: &str = "dead_lettered";
const COUNTER_MALFORMED: &str = "malformed";
const COUNTER_REAPED: &str = "reaped";

/// Entry of the processing index, keyed by `task_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct InFlight {
    envelope: TaskEnvelope,
    worker_id: String,
    started_at: DateTime<Utc>,
    /// Last lease renewal by the owning worker; the reaper measures from here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    leased_at: Option<DateTime<Utc>>,
}

impl InFlight {
    fn lease_start(&self) -> DateTime<Utc> {
        self.leased_at.unwrap_or(self.started_at)
    }
}

/// Lifetime counters of one queue-name. Never reset.
///
/// `failed` counts failed attempts, including those that were retried.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LifetimeCounters {
    pub queued: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub malformed: u64,
    pub reaped: u64,
}

impl LifetimeCounters {
    fn from_fields(fields: &HashMap<String, String>) -> Self {
        let read = |name: &str| {
            fields
                .get(name)
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0)
        };
        Self {
            queued: read(COUNTER_QUEUED),
            processing: read(COUNTER_PROCESSING),
            completed: read(COUNTER_COMPLETED),
            failed: read(COUNTER_FAILED),
            retried: read(COUNTER_RETRIED),
            dead_lettered: read(COUNTER_DEAD_LETTERED),
            malformed: read(COUNTER_MALFORMED),
            reaped: read(COUNTER_REAPED),
        }
    }
}

/// Statistics about queue state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queue_name: String,
    /// Tasks waiting to be dequeued.
    pub pending: usize,
    /// Retries waiting out their backoff.
    pub delayed: usize,
    /// Tasks dequeued and not yet completed.
    pub processing: usize,
    pub dead_letter: usize,
    pub lifetime: LifetimeCounters,
}

impl QueueStats {
    /// Returns the total number of tasks held in any storage area.
    pub fn total_jobs(&self) -> usize {
        self.pending + self.delayed + self.processing + self.dead_letter
    }
}

/// Façade over one queue-name in the backing store.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
#[derive(Debug)]
pub struct QueueManager {
    backend: Arc<dyn QueueBackend>,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
    keys: QueueKeys,
    metrics: MetricsCollector,
}

impl QueueManager {
    /// Connects to the Redis store named by `config.redis_url`.
    ///
    /// Makes up to `config.connect_attempts` attempts with exponential backoff
    /// (1s, 2s, 4s, ... capped at `config.connect_max_backoff`). Each attempt
    /// pings the store and then writes and deletes a probe key, so a read-only
    /// replica left behind by a failover is rejected instead of silently
    /// accepting enqueues that fail later.
    ///
    /// # Errors
    ///
    /// - `QueueError::Config` if `config` does not validate
    /// - `QueueError::ReadOnlyReplica` if every attempt reached a read-only endpoint
    /// - `QueueError::ConnectFailed` otherwise, once attempts are exhausted
    pub async fn connect(config: QueueConfig) -> Result<Self, QueueError> {
        config.validate()?;
        let keys = QueueKeys::new(&config.queue_name);
        let attempts = config.connect_attempts.max(1);
        let mut last_error = StoreError::Connection("no connection attempt made".to_string());
        let mut made = 0;

        for attempt in 1..=attempts {
            made = attempt;
            match Self::open_verified(&config.redis_url, &keys.probe).await {
                Ok(backend) => {
                    info!(
                        queue = %config.queue_name,
                        endpoint = %backend.describe(),
                        attempt,
                        "Connected to queue store"
                    );
                    return Ok(Self::with_backend(config, backend, Arc::new(SystemClock)));
                }
                Err(err) => {
                    warn!(
                        queue = %config.queue_name,
                        attempt,
                        max_attempts = attempts,
                        error = %err,
                        "Queue store connection attempt failed"
                    );
                    let retry = err.is_transient();
                    last_error = err;
                    if !retry {
                        break;
                    }
                }
            }

            if attempt < attempts {
                let delay = connect_backoff(attempt, config.connect_max_backoff);
                tokio::time::sleep(delay).await;
            }
        }

        error!(
            queue = %config.queue_name,
            attempts = made,
            error = %last_error,
            "Giving up connecting to queue store"
        );
        match last_error {
            StoreError::ReadOnly(_) => Err(QueueError::ReadOnlyReplica(config.redis_url.clone())),
            other => Err(QueueError::ConnectFailed {
                attempts: made,
                last_error: other.to_string(),
            }),
        }
    }

    async fn open_verified(
        redis_url: &str,
        probe_key: &str,
    ) -> Result<Arc<dyn QueueBackend>, StoreError> {
        let backend = RedisBackend::connect(redis_url).await?;
        backend.ping().await?;
        backend.probe_write(probe_key).await?;
        Ok(Arc::new(backend))
    }

    /// Creates a manager over an already-open backend.
    pub fn with_backend(
        config: QueueConfig,
        backend: Arc<dyn QueueBackend>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let keys = QueueKeys::new(&config.queue_name);
        Self {
            backend,
            clock,
            config,
            keys,
            metrics: MetricsCollector::new(),
        }
    }

    /// Re-runs the liveness check made by `connect()` (ping plus probe write).
    pub async fn verify_liveness(&self) -> Result<(), QueueError> {
        let check = async {
            self.backend.ping().await?;
            self.backend.probe_write(&self.keys.probe).await
        };
        match check.await {
            Ok(()) => Ok(()),
            Err(StoreError::ReadOnly(_)) => {
                Err(QueueError::ReadOnlyReplica(self.backend.describe()))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.config.queue_name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Current time as seen by this queue's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }

    // ---- producers -------------------------------------------------------

    /// Places `envelope` on the queue and writes its initial `queued` Status Record.
    ///
    /// `created_at` is stamped here. Priority envelopes (`priority > 1`) go to
    /// the head of the queue, others to the tail. The Status Record is written
    /// before the push, so once this returns `Ok` both exist; if the push
    /// fails the record is removed again.
    ///
    /// # Errors
    ///
    /// - `QueueError::QueueFull` when the pending depth has reached `max_queue_size`
    /// - `QueueError::Store` when the store stays unreachable after retries; the
    ///   envelope is then not queued and the caller decides the fallback
    pub async fn enqueue(&self, mut envelope: TaskEnvelope) -> Result<(), QueueError> {
        envelope.created_at = self.clock.now();
        self.ensure_capacity(1).await?;

        let raw = serde_json::to_string(&envelope)?;
        let end = end_for(&envelope);

        self.write_status(&envelope.job_id, &StatusUpdate::queued(&envelope))
            .await?;
        let pushed = self
            .with_store_retry("enqueue", || {
                self.backend.push(&self.keys.pending, &raw, end)
            })
            .await;
        let depth = match pushed {
            Ok(depth) => depth,
            Err(err) => {
                self.forget_status(&envelope.job_id).await;
                return Err(err.into());
            }
        };

        self.bump(COUNTER_QUEUED, 1).await;
        self.metrics
            .record_enqueued(self.queue_name(), envelope.kind().as_str(), 1);
        info!(
            queue = %self.config.queue_name,
            task_id = %envelope.task_id,
            job_id = %envelope.job_id,
            task_type = %envelope.kind(),
            priority = envelope.priority,
            depth,
            "Task enqueued"
        );
        Ok(())
    }

    /// Enqueues several envelopes with one atomic push.
    ///
    /// Priority rules apply per envelope. Returns the number enqueued.
    pub async fn enqueue_batch(&self, envelopes: Vec<TaskEnvelope>) -> Result<usize, QueueError> {
        if envelopes.is_empty() {
            return Ok(0);
        }
        self.ensure_capacity(envelopes.len()).await?;

        let now = self.clock.now();
        let mut items = Vec::with_capacity(envelopes.len());
        let mut stamped = Vec::with_capacity(envelopes.len());
        for mut envelope in envelopes {
            envelope.created_at = now;
            items.push((serde_json::to_string(&envelope)?, end_for(&envelope)));
            stamped.push(envelope);
        }

        for envelope in &stamped {
            self.write_status(&envelope.job_id, &StatusUpdate::queued(envelope))
                .await?;
        }
        let pushed = self
            .with_store_retry("enqueue_batch", || {
                self.backend.push_batch(&self.keys.pending, &items)
            })
            .await;
        let depth = match pushed {
            Ok(depth) => depth,
            Err(err) => {
                for envelope in &stamped {
                    self.forget_status(&envelope.job_id).await;
                }
                return Err(err.into());
            }
        };

        let count = stamped.len();
        self.bump(COUNTER_QUEUED, count as i64).await;
        for envelope in &stamped {
            self.metrics
                .record_enqueued(self.queue_name(), envelope.kind().as_str(), 1);
        }
        info!(
            queue = %self.config.queue_name,
            count,
            depth,
            "Task batch enqueued"
        );
        Ok(count)
    }

    async fn ensure_capacity(&self, incoming: usize) -> Result<(), QueueError> {
        let limit = self.config.max_queue_size;
        if limit == 0 {
            return Ok(());
        }
        let depth = self.backend.list_len(&self.keys.pending).await?;
        if depth + incoming > limit {
            warn!(
                queue = %self.config.queue_name,
                depth,
                limit,
                "Queue full, refusing enqueue"
            );
            return Err(QueueError::QueueFull {
                queue: self.config.queue_name.clone(),
                limit,
            });
        }
        Ok(())
    }

    // ---- workers ---------------------------------------------------------

    /// Waits up to `timeout` for the next task.
    ///
    /// Returns `Ok(None)` when nothing arrived. On success the task is recorded
    /// in the processing index under `worker_id` and its Status Record moves to
    /// `processing`.
    ///
    /// # Errors
    ///
    /// `QueueError::MalformedEnvelope` when the popped item does not parse; the
    /// item has already been discarded and the caller should just continue.
    pub async fn dequeue(
        &self,
        worker_id: &str,
        timeout: Duration,
    ) -> Result<Option<TaskEnvelope>, QueueError> {
        let Some(raw) = self
            .backend
            .blocking_move(&self.keys.pending, &self.keys.claimed, timeout)
            .await?
        else {
            return Ok(None);
        };

        let envelope = match serde_json::from_str::<TaskEnvelope>(&raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                if let Err(remove_err) = self.backend.list_remove(&self.keys.claimed, &raw).await
                {
                    warn!(
                        queue = %self.config.queue_name,
                        error = %remove_err,
                        "Failed to discard malformed item; orphan recovery will requeue it"
                    );
                }
                self.bump(COUNTER_MALFORMED, 1).await;
                self.metrics.record_outcome(self.queue_name(), "malformed");
                warn!(
                    queue = %self.config.queue_name,
                    worker_id,
                    error = %err,
                    raw_len = raw.len(),
                    "Dropped malformed envelope"
                );
                return Err(QueueError::MalformedEnvelope {
                    queue: self.config.queue_name.clone(),
                    reason: err.to_string(),
                });
            }
        };

        let started_at = self.clock.now();
        let record = serde_json::to_string(&InFlight {
            envelope: envelope.clone(),
            worker_id: worker_id.to_string(),
            started_at,
            leased_at: None,
        })?;
        self.with_store_retry("index", || {
            self.backend.index_claimed(
                &self.keys.claimed,
                &raw,
                &self.keys.processing,
                &envelope.task_id,
                &record,
            )
        })
        .await?;

        self.record_status(
            &envelope.job_id,
            StatusUpdate::processing(worker_id, started_at, envelope.retry_count),
        )
        .await;
        self.bump(COUNTER_PROCESSING, 1).await;
        debug!(
            queue = %self.config.queue_name,
            worker_id,
            task_id = %envelope.task_id,
            job_id = %envelope.job_id,
            retry_count = envelope.retry_count,
            "Task dequeued"
        );
        Ok(Some(envelope))
    }

    /// Reports the outcome of a dequeued task.
    ///
    /// Success writes the terminal status. Failure applies the retry policy:
    /// the task either waits in the delayed set for its next attempt or moves
    /// to the dead-letter store with status `failed`.
    ///
    /// Only the first call for an in-flight task has any effect; later calls
    /// (or calls for a task the reaper already took back) return
    /// [`CompletionOutcome::NotInFlight`].
    pub async fn complete(
        &self,
        task_id: &str,
        job_id: &str,
        outcome: TaskOutcome,
    ) -> Result<CompletionOutcome, QueueError> {
        let Some(raw) = self
            .with_store_retry("complete", || {
                self.backend.hash_get(&self.keys.processing, task_id)
            })
            .await?
        else {
            debug!(
                queue = %self.config.queue_name,
                task_id,
                job_id,
                "Completion for task not in flight ignored"
            );
            return Ok(CompletionOutcome::NotInFlight);
        };

        let in_flight = match serde_json::from_str::<InFlight>(&raw) {
            Ok(in_flight) => in_flight,
            Err(err) => {
                self.discard_in_flight(task_id, &err.to_string()).await;
                return Err(QueueError::MalformedEnvelope {
                    queue: self.config.queue_name.clone(),
                    reason: err.to_string(),
                });
            }
        };
        if in_flight.envelope.job_id != job_id {
            warn!(
                queue = %self.config.queue_name,
                task_id,
                reported_job_id = job_id,
                job_id = %in_flight.envelope.job_id,
                "Completion job_id does not match the in-flight envelope; using the envelope's"
            );
        }

        match outcome {
            TaskOutcome::Succeeded(output) => {
                let retired = self
                    .with_store_retry("complete", || {
                        self.backend
                            .retire(&self.keys.processing, task_id, Transfer::Drop)
                    })
                    .await?;
                if !retired {
                    return Ok(CompletionOutcome::NotInFlight);
                }

                let envelope = &in_flight.envelope;
                self.record_status(
                    &envelope.job_id,
                    StatusUpdate::completed(&output.result, output.partial, self.clock.now()),
                )
                .await;
                self.bump(COUNTER_COMPLETED, 1).await;

                let outcome = CompletionOutcome::Completed {
                    partial: output.partial,
                };
                self.metrics.record_outcome(self.queue_name(), outcome.label());
                info!(
                    queue = %self.config.queue_name,
                    task_id,
                    job_id = %envelope.job_id,
                    worker_id = %in_flight.worker_id,
                    outcome = outcome.label(),
                    "Task completed"
                );
                Ok(outcome)
            }
            TaskOutcome::Failed(err) => {
                self.fail_in_flight(in_flight, &err.message, err.retryable)
                    .await
            }
        }
    }

    /// Applies the retry policy to an in-flight entry whose attempt failed.
    async fn fail_in_flight(
        &self,
        in_flight: InFlight,
        error: &str,
        retryable: bool,
    ) -> Result<CompletionOutcome, QueueError> {
        let now = self.clock.now();
        let task_id = in_flight.envelope.task_id.clone();

        match self.config.retry.decide(&in_flight.envelope, retryable) {
            FailureAction::Retry { envelope, delay } => {
                let due_at = ChronoDuration::from_std(delay)
                    .ok()
                    .and_then(|d| now.checked_add_signed(d))
                    .unwrap_or(now);
                let raw = serde_json::to_string(&envelope)?;

                let retired = self
                    .with_store_retry("retry", || {
                        self.backend.retire(
                            &self.keys.processing,
                            &task_id,
                            Transfer::Delay {
                                zset: &self.keys.delayed,
                                value: &raw,
                                due_at_ms: due_at.timestamp_millis(),
                            },
                        )
                    })
                    .await?;
                if !retired {
                    return Ok(CompletionOutcome::NotInFlight);
                }

                self.record_status(
                    &envelope.job_id,
                    StatusUpdate::retrying(error, envelope.retry_count, due_at),
                )
                .await;
                self.bump(COUNTER_FAILED, 1).await;
                self.bump(COUNTER_RETRIED, 1).await;

                let outcome = CompletionOutcome::Retrying {
                    retry_count: envelope.retry_count,
                    delay,
                };
                self.metrics.record_outcome(self.queue_name(), outcome.label());
                warn!(
                    queue = %self.config.queue_name,
                    task_id = %task_id,
                    job_id = %envelope.job_id,
                    retry_count = envelope.retry_count,
                    max_retries = envelope.max_retries,
                    delay_secs = delay.as_secs(),
                    error,
                    "Task failed, retry scheduled"
                );
                Ok(outcome)
            }
            FailureAction::DeadLetter { envelope } => {
                let retry_count = envelope.retry_count;
                let job_id = envelope.job_id.clone();
                let raw = serde_json::to_string(&DeadLetterEntry::new(envelope, error, now))?;

                let retired = self
                    .with_store_retry("dead_letter", || {
                        self.backend.retire(
                            &self.keys.processing,
                            &task_id,
                            Transfer::Push {
                                list: &self.keys.dead_letter,
                                value: &raw,
                                end: ListEnd::Back,
                            },
                        )
                    })
                    .await?;
                if !retired {
                    return Ok(CompletionOutcome::NotInFlight);
                }

                self.record_status(&job_id, StatusUpdate::failed(error, retry_count, now))
                    .await;
                self.bump(COUNTER_FAILED, 1).await;
                self.bump(COUNTER_DEAD_LETTERED, 1).await;

                let outcome = CompletionOutcome::DeadLettered { retry_count };
                self.metrics.record_outcome(self.queue_name(), outcome.label());
                error!(
                    queue = %self.config.queue_name,
                    task_id = %task_id,
                    job_id = %job_id,
                    retry_count,
                    retryable,
                    error,
                    "Task moved to dead-letter store"
                );
                Ok(outcome)
            }
        }
    }

    /// Drops an unreadable processing-index entry.
    async fn discard_in_flight(&self, task_id: &str, reason: &str) {
        match self
            .backend
            .retire(&self.keys.processing, task_id, Transfer::Drop)
            .await
        {
            Ok(true) => {
                self.bump(COUNTER_MALFORMED, 1).await;
                self.metrics.record_outcome(self.queue_name(), "malformed");
                warn!(
                    queue = %self.config.queue_name,
                    task_id,
                    reason,
                    "Dropped unreadable in-flight entry"
                );
            }
            Ok(false) => {}
            Err(err) => warn!(
                queue = %self.config.queue_name,
                task_id,
                error = %err,
                "Failed to drop unreadable in-flight entry"
            ),
        }
    }

    /// Moves retries whose backoff has elapsed back onto the queue.
    ///
    /// Safe to call from any number of workers at once; each delayed entry is
    /// promoted exactly once.
    pub async fn promote_due(&self) -> Result<usize, QueueError> {
        let now_ms = self.clock.now().timestamp_millis();
        let moved = self
            .backend
            .promote_due(&self.keys.delayed, &self.keys.pending, now_ms, PROMOTE_BATCH)
            .await?;
        if moved > 0 {
            debug!(queue = %self.config.queue_name, moved, "Promoted due retries");
        }
        Ok(moved)
    }

    // ---- status side channel --------------------------------------------

    /// Point lookup of a Status Record. `None` means unknown or expired.
    pub async fn get_status(&self, job_id: &str) -> Result<Option<StatusRecord>, QueueError> {
        let fields = self
            .backend
            .hash_get_all(&self.keys.status(job_id))
            .await?;
        Ok(StatusRecord::from_fields(job_id, &fields))
    }

    /// Merges `update` into the Status Record and refreshes its TTL.
    pub async fn set_status(&self, job_id: &str, update: StatusUpdate) -> Result<(), QueueError> {
        Ok(self.write_status(job_id, &update).await?)
    }

    async fn write_status(&self, job_id: &str, update: &StatusUpdate) -> Result<(), StoreError> {
        let key = self.keys.status(job_id);
        self.with_store_retry("status", || {
            self.backend.hash_merge(
                &key,
                update.fields_to_set(),
                update.fields_to_remove(),
                self.config.status_retention,
            )
        })
        .await
    }

    /// Drops the Status Record of a job that never reached the queue.
    async fn forget_status(&self, job_id: &str) {
        if let Err(err) = self.backend.delete(&self.keys.status(job_id)).await {
            warn!(
                queue = %self.config.queue_name,
                job_id,
                error = %err,
                "Failed to remove status of unqueued job"
            );
        }
    }

    /// Status write after the envelope has already moved; failure is logged only.
    async fn record_status(&self, job_id: &str, update: StatusUpdate) {
        let key = self.keys.status(job_id);
        if let Err(err) = self
            .backend
            .hash_merge(
                &key,
                update.fields_to_set(),
                update.fields_to_remove(),
                self.config.status_retention,
            )
            .await
        {
            warn!(
                queue = %self.config.queue_name,
                job_id,
                error = %err,
                "Failed to update status record"
            );
        }
    }

    /// Deletes Status Records created more than `age` ago.
    ///
    /// Best-effort per record; the queue and dead-letter store are untouched.
    /// Returns the number deleted.
    pub async fn cleanup_old_statuses(&self, age: Duration) -> Result<usize, QueueError> {
        let cutoff = ChronoDuration::from_std(age)
            .ok()
            .and_then(|age| self.clock.now().checked_sub_signed(age));
        let Some(cutoff) = cutoff else {
            return Ok(0);
        };

        let keys = self.backend.scan_prefix(self.keys.status_prefix()).await?;
        let mut deleted = 0;
        for key in keys {
            let fields = match self.backend.hash_get_all(&key).await {
                Ok(fields) => fields,
                Err(err) => {
                    warn!(key = %key, error = %err, "Skipping status record during cleanup");
                    continue;
                }
            };
            let stale = StatusRecord::created_at_of(&fields).is_some_and(|at| at < cutoff);
            if !stale {
                continue;
            }
            match self.backend.delete(&key).await {
                Ok(true) => deleted += 1,
                Ok(false) => {}
                Err(err) => warn!(key = %key, error = %err, "Failed to delete stale status record"),
            }
        }

        if deleted > 0 {
            info!(queue = %self.config.queue_name, deleted, "Cleaned up old status records");
        }
        Ok(deleted)
    }

    // ---- observability ---------------------------------------------------

    /// Number of tasks waiting to be dequeued.
    pub async fn get_queue_depth(&self) -> Result<usize, QueueError> {
        Ok(self.backend.list_len(&self.keys.pending).await?)
    }

    /// Current sizes of every storage area plus the lifetime counters.
    pub async fn get_stats(&self) -> Result<QueueStats, QueueError> {
        let (pending, delayed, processing, dead_letter, counters) = tokio::try_join!(
            self.backend.list_len(&self.keys.pending),
            self.backend.delayed_len(&self.keys.delayed),
            self.backend.hash_len(&self.keys.processing),
            self.backend.list_len(&self.keys.dead_letter),
            self.backend.hash_get_all(&self.keys.stats),
        )?;

        self.metrics.update_queue_depths(
            self.queue_name(),
            QueueDepths {
                pending,
                delayed,
                processing,
                dead_letter,
            },
        );

        Ok(QueueStats {
            queue_name: self.config.queue_name.clone(),
            pending,
            delayed,
            processing,
            dead_letter,
            lifetime: LifetimeCounters::from_fields(&counters),
        })
    }

    // ---- dead-letter operations -----------------------------------------

    /// Oldest-first view of up to `limit` dead-letter entries.
    pub async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let stop = isize::try_from(limit).unwrap_or(isize::MAX) - 1;
        let raw = self
            .backend
            .list_range(&self.keys.dead_letter, 0, stop)
            .await?;

        Ok(raw
            .iter()
            .filter_map(|item| match serde_json::from_str::<DeadLetterEntry>(item) {
                Ok(entry) => Some(entry),
                Err(err) => {
                    warn!(
                        queue = %self.config.queue_name,
                        error = %err,
                        "Skipping unreadable dead-letter entry"
                    );
                    None
                }
            })
            .collect())
    }

    async fn find_dead_letter(
        &self,
        task_id: &str,
    ) -> Result<Option<(String, DeadLetterEntry)>, QueueError> {
        let raw = self
            .backend
            .list_range(&self.keys.dead_letter, 0, -1)
            .await?;
        Ok(raw.into_iter().find_map(|item| {
            serde_json::from_str::<DeadLetterEntry>(&item)
                .ok()
                .filter(|entry| entry.task_id() == task_id)
                .map(|entry| (item, entry))
        }))
    }

    /// Replays a dead-lettered task with a fresh retry budget.
    ///
    /// Returns the envelope as re-enqueued.
    ///
    /// # Errors
    ///
    /// `QueueError::DeadLetterNotFound` if no entry has that `task_id`, including
    /// when another operator replayed or purged it first.
    pub async fn retry_dead_letter(&self, task_id: &str) -> Result<TaskEnvelope, QueueError> {
        let Some((raw_entry, entry)) = self.find_dead_letter(task_id).await? else {
            return Err(QueueError::DeadLetterNotFound(task_id.to_string()));
        };

        let mut envelope = entry.replay_envelope();
        envelope.created_at = self.clock.now();
        let raw_envelope = serde_json::to_string(&envelope)?;

        let moved = self
            .backend
            .move_item(
                &self.keys.dead_letter,
                &raw_entry,
                &self.keys.pending,
                &raw_envelope,
                end_for(&envelope),
            )
            .await?;
        if !moved {
            return Err(QueueError::DeadLetterNotFound(task_id.to_string()));
        }

        self.record_status(&envelope.job_id, StatusUpdate::queued(&envelope))
            .await;
        self.bump(COUNTER_QUEUED, 1).await;
        self.metrics
            .record_enqueued(self.queue_name(), envelope.kind().as_str(), 1);
        info!(
            queue = %self.config.queue_name,
            task_id,
            job_id = %envelope.job_id,
            final_error = %entry.final_error,
            "Dead-letter entry replayed"
        );
        Ok(envelope)
    }

    /// Deletes one dead-letter entry. Returns whether it existed.
    pub async fn purge_dead_letter(&self, task_id: &str) -> Result<bool, QueueError> {
        let Some((raw_entry, _)) = self.find_dead_letter(task_id).await? else {
            return Ok(false);
        };
        let removed = self
            .backend
            .list_remove(&self.keys.dead_letter, &raw_entry)
            .await?;
        if removed > 0 {
            info!(queue = %self.config.queue_name, task_id, "Dead-letter entry purged");
        }
        Ok(removed > 0)
    }

    /// Deletes every dead-letter entry. Returns how many there were.
    pub async fn purge_all_dead_letters(&self) -> Result<usize, QueueError> {
        let count = self.backend.list_len(&self.keys.dead_letter).await?;
        self.backend.delete(&self.keys.dead_letter).await?;
        warn!(queue = %self.config.queue_name, count, "Dead-letter store purged");
        Ok(count)
    }

    // ---- crash recovery --------------------------------------------------

    /// Renews the lease of an in-flight task so the reaper leaves it alone.
    ///
    /// Returns `false` when the task is no longer in flight, e.g. because it
    /// was already reaped. The swap is conditional on the entry being
    /// unchanged, so a lease is never written onto another worker's claim.
    pub async fn touch_in_flight(&self, task_id: &str) -> Result<bool, QueueError> {
        let Some(raw) = self.backend.hash_get(&self.keys.processing, task_id).await? else {
            return Ok(false);
        };
        let mut in_flight: InFlight = serde_json::from_str(&raw)?;
        in_flight.leased_at = Some(self.clock.now());
        let renewed = serde_json::to_string(&in_flight)?;

        let touched = self
            .backend
            .hash_compare_and_set(&self.keys.processing, task_id, &raw, &renewed)
            .await?;
        debug!(
            queue = %self.config.queue_name,
            task_id = %task_id,
            touched,
            "Renewed in-flight lease"
        );
        Ok(touched)
    }

    /// Takes back in-flight tasks older than `visibility_timeout`.
    ///
    /// Each one counts as a failed attempt and goes through the normal retry
    /// policy. A worker that later reports the task gets `NotInFlight`.
    /// Returns the number reaped.
    pub async fn reap_stale(&self, visibility_timeout: Duration) -> Result<usize, QueueError> {
        let entries = self.backend.hash_get_all(&self.keys.processing).await?;
        let now = self.clock.now();
        let timeout = ChronoDuration::from_std(visibility_timeout).unwrap_or(ChronoDuration::MAX);
        let mut reaped = 0;

        for (task_id, raw) in entries {
            let in_flight = match serde_json::from_str::<InFlight>(&raw) {
                Ok(in_flight) => in_flight,
                Err(err) => {
                    self.discard_in_flight(&task_id, &err.to_string()).await;
                    continue;
                }
            };
            if now.signed_duration_since(in_flight.lease_start()) < timeout {
                continue;
            }

            let worker_id = in_flight.worker_id.clone();
            match self
                .fail_in_flight(in_flight, VISIBILITY_TIMEOUT_ERROR, true)
                .await
            {
                Ok(CompletionOutcome::NotInFlight) => {}
                Ok(outcome) => {
                    reaped += 1;
                    warn!(
                        queue = %self.config.queue_name,
                        task_id = %task_id,
                        worker_id = %worker_id,
                        outcome = outcome.label(),
                        "Reaped stale in-flight task"
                    );
                }
                Err(err) => warn!(
                    queue = %self.config.queue_name,
                    task_id = %task_id,
                    error = %err,
                    "Failed to reap stale in-flight task"
                ),
            }
        }

        if reaped > 0 {
            self.bump(COUNTER_REAPED, reaped as i64).await;
            self.metrics
                .record_outcomes(self.queue_name(), "reaped", reaped as u64);
        }
        Ok(reaped)
    }

    /// Requeues items stranded in the claimed list by a worker that died
    /// between popping and indexing them.
    ///
    /// An item is requeued only if it was already present at the previous
    /// sweep; `suspects` carries that memory between calls and is updated.
    pub async fn recover_orphans(
        &self,
        suspects: &mut HashSet<String>,
    ) -> Result<usize, QueueError> {
        let claimed = self
            .backend
            .list_range(&self.keys.claimed, 0, -1)
            .await?;

        let mut still_suspect = HashSet::new();
        let mut requeued = 0;
        for raw in claimed {
            if !suspects.contains(&raw) {
                still_suspect.insert(raw);
                continue;
            }
            let end = if raw_is_priority(&raw) {
                ListEnd::Front
            } else {
                ListEnd::Back
            };
            if self
                .backend
                .move_item(&self.keys.claimed, &raw, &self.keys.pending, &raw, end)
                .await?
            {
                requeued += 1;
            }
        }
        *suspects = still_suspect;

        if requeued > 0 {
            warn!(
                queue = %self.config.queue_name,
                requeued,
                "Requeued orphaned claimed items"
            );
        }
        Ok(requeued)
    }

    // ---- helpers ---------------------------------------------------------

    /// Runs `op`, retrying transient store errors with exponential backoff.
    async fn with_store_retry<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < STORE_RETRIES => {
                    let delay = STORE_RETRY_BASE * 2u32.pow(attempt);
                    attempt += 1;
                    warn!(
                        queue = %self.config.queue_name,
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient store error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Best-effort counter increment.
    async fn bump(&self, counter: &str, by: i64) {
        if let Err(err) = self.backend.hash_incr(&self.keys.stats, counter, by).await {
            warn!(
                queue = %self.config.queue_name,
                counter,
                error = %err,
                "Failed to update queue counter"
            );
        }
    }
}

fn end_for(envelope: &TaskEnvelope) -> ListEnd {
    if envelope.is_priority() {
        ListEnd::Front
    } else {
        ListEnd::Back
    }
}

/// Delay after failed connection attempt `attempt` (1-based).
fn connect_backoff(attempt: u32, cap: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    CONNECT_BACKOFF_BASE
        .checked_mul(1u32 << exponent)
        .unwrap_or(cap)
        .min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::HandlerError;
    use crate::queue::backend::MemoryBackend;
    use crate::queue::envelope::{FormatDocumentPayload, TaskPayload};
    use crate::queue::outcome::TaskOutput;
    use crate::queue::status::JobState;

    struct Harness {
        manager: QueueManager,
        backend: Arc<MemoryBackend>,
        clock: Arc<ManualClock>,
    }

    fn harness(config: QueueConfig) -> Harness {
        let clock = Arc::new(ManualClock::default());
        let backend = Arc::new(MemoryBackend::with_clock(clock.clone()));
        let manager = QueueManager::with_backend(config, backend.clone(), clock.clone());
        Harness {
            manager,
            backend,
            clock,
        }
    }

    fn envelope(id: &str) -> TaskEnvelope {
        TaskEnvelope::new(
            "owner-1",
            TaskPayload::FormatDocument(FormatDocumentPayload {
                document_id: format!("doc-{}", id),
                content: "# Title".into(),
                style: "apa".into(),
            }),
        )
        .with_task_id(id)
        .with_job_id(format!("job-{}", id))
    }

    #[test]
    fn test_connect_backoff_is_capped() {
        let cap = Duration::from_secs(30);
        assert_eq!(connect_backoff(1, cap), Duration::from_secs(1));
        assert_eq!(connect_backoff(2, cap), Duration::from_secs(2));
        assert_eq!(connect_backoff(5, cap), Duration::from_secs(16));
        assert_eq!(connect_backoff(6, cap), cap);
        assert_eq!(connect_backoff(40, cap), cap);
    }

    #[test]
    fn test_lifetime_counters_parse_missing_as_zero() {
        let fields = HashMap::from([
            ("completed".to_string(), "7".to_string()),
            ("failed".to_string(), "oops".to_string()),
        ]);
        let counters = LifetimeCounters::from_fields(&fields);
        assert_eq!(counters.completed, 7);
        assert_eq!(counters.failed, 0);
        assert_eq!(counters.queued, 0);
    }

    #[test]
    fn test_queue_stats_total() {
        let stats = QueueStats {
            queue_name: "test".to_string(),
            pending: 10,
            delayed: 1,
            processing: 5,
            dead_letter: 2,
            lifetime: LifetimeCounters::default(),
        };
        assert_eq!(stats.total_jobs(), 18);
    }

    #[tokio::test]
    async fn test_connect_with_malformed_url_fails_fast() {
        let config = QueueConfig::new("connect_test").with_redis_url("not-a-url");
        let err = QueueManager::connect(config).await.unwrap_err();
        assert!(matches!(err, QueueError::ConnectFailed { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn test_verify_liveness_detects_read_only_replica() {
        let h = harness(QueueConfig::new("q"));
        assert!(h.manager.verify_liveness().await.is_ok());

        h.backend.set_read_only(true);
        let err = h.manager.verify_liveness().await.unwrap_err();
        assert!(matches!(err, QueueError::ReadOnlyReplica(_)));
    }

    #[tokio::test]
    async fn test_enqueue_stamps_created_at_and_writes_status() {
        let h = harness(QueueConfig::new("q"));
        let enqueued_at = h.clock.now();
        h.manager.enqueue(envelope("t1")).await.unwrap();

        let status = h.manager.get_status("job-t1").await.unwrap().unwrap();
        assert_eq!(status.status, JobState::Queued);
        assert_eq!(status.created_at, Some(enqueued_at));
        assert_eq!(status.task_id.as_deref(), Some("t1"));
        assert_eq!(status.details.get("style").map(String::as_str), Some("apa"));
    }

    #[tokio::test]
    async fn test_queue_full_rejects_enqueue() {
        let h = harness(QueueConfig::new("q").with_max_queue_size(2));
        h.manager.enqueue(envelope("a")).await.unwrap();
        h.manager.enqueue(envelope("b")).await.unwrap();

        let err = h.manager.enqueue(envelope("c")).await.unwrap_err();
        assert!(matches!(err, QueueError::QueueFull { limit: 2, .. }));
        assert_eq!(h.manager.get_queue_depth().await.unwrap(), 2);
        assert!(h.manager.get_status("job-c").await.unwrap().is_none());

        let err = h
            .manager
            .enqueue_batch(vec![envelope("d")])
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::QueueFull { .. }));
    }

    #[tokio::test]
    async fn test_failed_push_leaves_no_status_behind() {
        let h = harness(QueueConfig::new("q"));
        h.backend.set_rejecting_pushes(true);

        let err = h.manager.enqueue(envelope("t1")).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(h.manager.get_queue_depth().await.unwrap(), 0);
        assert!(h.manager.get_status("job-t1").await.unwrap().is_none());

        let err = h
            .manager
            .enqueue_batch(vec![envelope("t2"), envelope("t3")])
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(h.manager.get_status("job-t2").await.unwrap().is_none());
        assert!(h.manager.get_status("job-t3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_enqueue_batch_applies_priority_per_envelope() {
        let h = harness(QueueConfig::new("q"));
        let count = h
            .manager
            .enqueue_batch(vec![
                envelope("a"),
                envelope("b").with_priority(2),
                envelope("c"),
            ])
            .await
            .unwrap();
        assert_eq!(count, 3);
        assert_eq!(h.manager.enqueue_batch(Vec::new()).await.unwrap(), 0);

        let mut order = Vec::new();
        while let Some(task) = h
            .manager
            .dequeue("w", Duration::from_millis(10))
            .await
            .unwrap()
        {
            order.push(task.task_id);
        }
        assert_eq!(order, vec!["b", "a", "c"]);
        assert!(h.manager.get_status("job-c").await.unwrap().is_some());

        let stats = h.manager.get_stats().await.unwrap();
        assert_eq!(stats.lifetime.queued, 3);
    }

    #[tokio::test]
    async fn test_unreachable_store_fails_enqueue() {
        let h = harness(QueueConfig::new("q").with_max_queue_size(0));
        h.backend.set_unavailable(true);

        let err = h.manager.enqueue(envelope("t1")).await.unwrap_err();
        assert!(err.is_transient());

        h.backend.set_unavailable(false);
        assert_eq!(h.manager.get_queue_depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_malformed_item_is_dropped() {
        let h = harness(QueueConfig::new("q"));
        h.backend
            .push("q", "{not an envelope", ListEnd::Back)
            .await
            .unwrap();
        h.manager.enqueue(envelope("good")).await.unwrap();

        let err = h
            .manager
            .dequeue("w1", Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::MalformedEnvelope { .. }));

        let next = h
            .manager
            .dequeue("w1", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.task_id, "good");

        let stats = h.manager.get_stats().await.unwrap();
        assert_eq!(stats.lifetime.malformed, 1);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.processing, 1);
        assert!(h
            .backend
            .list_range("q:claimed", 0, -1)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_dequeue_timeout_returns_none() {
        let h = harness(QueueConfig::new("q"));
        let got = h
            .manager
            .dequeue("w1", Duration::from_millis(20))
            .await
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_partial_success_status() {
        let h = harness(QueueConfig::new("q"));
        h.manager.enqueue(envelope("t1")).await.unwrap();
        h.manager
            .dequeue("w1", Duration::from_millis(10))
            .await
            .unwrap();

        let outcome = h
            .manager
            .complete(
                "t1",
                "job-t1",
                TaskOutcome::Succeeded(TaskOutput::partial(serde_json::json!({"pages": 3}))),
            )
            .await
            .unwrap();
        assert_eq!(outcome, CompletionOutcome::Completed { partial: true });

        let status = h.manager.get_status("job-t1").await.unwrap().unwrap();
        assert_eq!(status.status, JobState::PartialSuccess);
        assert_eq!(status.result, Some(serde_json::json!({"pages": 3})));
        assert_eq!(status.worker_id.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn test_retry_waits_in_delayed_set_until_due() {
        let h = harness(QueueConfig::new("q"));
        h.manager.enqueue(envelope("t1")).await.unwrap();
        h.manager
            .dequeue("w1", Duration::from_millis(10))
            .await
            .unwrap();

        let outcome = h
            .manager
            .complete(
                "t1",
                "job-t1",
                TaskOutcome::Failed(HandlerError::retryable("provider timeout")),
            )
            .await
            .unwrap();
        assert_eq!(
            outcome,
            CompletionOutcome::Retrying {
                retry_count: 1,
                delay: Duration::from_secs(60)
            }
        );

        let status = h.manager.get_status("job-t1").await.unwrap().unwrap();
        assert_eq!(status.status, JobState::Queued);
        assert_eq!(status.last_error.as_deref(), Some("provider timeout"));
        assert!(status.error.is_none());
        assert!(status.next_attempt_at.is_some());

        assert_eq!(h.manager.promote_due().await.unwrap(), 0);
        h.clock.advance(Duration::from_secs(59));
        assert_eq!(h.manager.promote_due().await.unwrap(), 0);
        h.clock.advance(Duration::from_secs(1));
        assert_eq!(h.manager.promote_due().await.unwrap(), 1);

        let again = h
            .manager
            .dequeue("w2", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.retry_count, 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_skips_retries() {
        let h = harness(QueueConfig::new("q"));
        h.manager.enqueue(envelope("t1")).await.unwrap();
        h.manager
            .dequeue("w1", Duration::from_millis(10))
            .await
            .unwrap();

        let outcome = h
            .manager
            .complete(
                "t1",
                "job-t1",
                TaskOutcome::Failed(HandlerError::permanent("unsupported style")),
            )
            .await
            .unwrap();
        assert_eq!(outcome, CompletionOutcome::DeadLettered { retry_count: 0 });

        let dead = h.manager.list_dead_letters(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].final_error, "unsupported style");
    }

    #[tokio::test]
    async fn test_dead_letter_replay_and_purge() {
        let h = harness(QueueConfig::new("q"));
        for id in ["a", "b"] {
            h.manager.enqueue(envelope(id)).await.unwrap();
            h.manager
                .dequeue("w1", Duration::from_millis(10))
                .await
                .unwrap();
            h.manager
                .complete(
                    id,
                    &format!("job-{}", id),
                    TaskOutcome::Failed(HandlerError::permanent("bad input")),
                )
                .await
                .unwrap();
        }

        let replayed = h.manager.retry_dead_letter("a").await.unwrap();
        assert_eq!(replayed.retry_count, 0);
        assert_eq!(h.manager.get_queue_depth().await.unwrap(), 1);
        let status = h.manager.get_status("job-a").await.unwrap().unwrap();
        assert_eq!(status.status, JobState::Queued);
        assert!(status.error.is_none());

        assert!(matches!(
            h.manager.retry_dead_letter("a").await,
            Err(QueueError::DeadLetterNotFound(_))
        ));

        assert!(h.manager.purge_dead_letter("b").await.unwrap());
        assert!(!h.manager.purge_dead_letter("b").await.unwrap());
        assert_eq!(h.manager.get_stats().await.unwrap().dead_letter, 0);
    }

    #[tokio::test]
    async fn test_purge_all_dead_letters() {
        let h = harness(QueueConfig::new("q"));
        for id in ["a", "b", "c"] {
            h.manager.enqueue(envelope(id)).await.unwrap();
            h.manager
                .dequeue("w1", Duration::from_millis(10))
                .await
                .unwrap();
            h.manager
                .complete(id, "", TaskOutcome::Failed(HandlerError::permanent("x")))
                .await
                .unwrap();
        }
        assert_eq!(h.manager.purge_all_dead_letters().await.unwrap(), 3);
        assert!(h.manager.list_dead_letters(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reaper_retries_abandoned_task() {
        let h = harness(QueueConfig::new("q"));
        h.manager.enqueue(envelope("t1")).await.unwrap();
        h.manager
            .dequeue("crashed-worker", Duration::from_millis(10))
            .await
            .unwrap();

        let timeout = Duration::from_secs(1800);
        assert_eq!(h.manager.reap_stale(timeout).await.unwrap(), 0);

        h.clock.advance(timeout);
        assert_eq!(h.manager.reap_stale(timeout).await.unwrap(), 1);

        let stats = h.manager.get_stats().await.unwrap();
        assert_eq!(stats.processing, 0);
        assert_eq!(stats.delayed, 1);
        assert_eq!(stats.lifetime.reaped, 1);

        // The slow worker finally reports: nothing changes.
        let late = h
            .manager
            .complete(
                "t1",
                "job-t1",
                TaskOutcome::Succeeded(TaskOutput::complete(serde_json::json!(null))),
            )
            .await
            .unwrap();
        assert_eq!(late, CompletionOutcome::NotInFlight);
        assert_eq!(h.manager.get_stats().await.unwrap().lifetime.completed, 0);
    }

    #[tokio::test]
    async fn test_orphans_requeued_on_second_sighting() {
        let h = harness(QueueConfig::new("q"));
        let raw = serde_json::to_string(&envelope("orphan")).unwrap();
        h.backend
            .push("q:claimed", &raw, ListEnd::Back)
            .await
            .unwrap();

        let mut suspects = HashSet::new();
        assert_eq!(h.manager.recover_orphans(&mut suspects).await.unwrap(), 0);
        assert_eq!(suspects.len(), 1);
        assert_eq!(h.manager.recover_orphans(&mut suspects).await.unwrap(), 1);
        assert!(suspects.is_empty());
        assert_eq!(h.manager.get_queue_depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_set_status_merges_fields() {
        let h = harness(QueueConfig::new("q"));
        h.manager.enqueue(envelope("t1")).await.unwrap();

        h.manager
            .set_status("job-t1", StatusUpdate::new().detail("progress", "40%"))
            .await
            .unwrap();

        let status = h.manager.get_status("job-t1").await.unwrap().unwrap();
        assert_eq!(status.status, JobState::Queued);
        assert_eq!(status.owner_id.as_deref(), Some("owner-1"));
        assert_eq!(status.details.get("progress").map(String::as_str), Some("40%"));
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_old_records() {
        let h = harness(QueueConfig::new("q"));
        h.manager.enqueue(envelope("old")).await.unwrap();
        h.clock.advance(Duration::from_secs(3 * 3600));
        h.manager.enqueue(envelope("new")).await.unwrap();

        let deleted = h
            .manager
            .cleanup_old_statuses(Duration::from_secs(2 * 3600))
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(h.manager.get_status("job-old").await.unwrap().is_none());
        assert!(h.manager.get_status("job-new").await.unwrap().is_some());
        assert_eq!(h.manager.get_queue_depth().await.unwrap(), 2);
    }
}
