//! A single worker draining one queue.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::handler::{dispatch, TaskExecutor};
use super::pool::SharedPoolStats;
use crate::error::QueueError;
use crate::metrics::MetricsCollector;
use crate::queue::{CompletionOutcome, QueueManager, TaskEnvelope};

/// Default wait for a task before the loop re-checks for shutdown.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Default pause after a loop error such as a lost store connection.
pub const DEFAULT_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Lease renewals per visibility timeout while a handler runs.
const LEASE_RENEWALS_PER_TIMEOUT: u32 = 3;

/// A worker that processes tasks from one queue until told to stop.
///
/// Workers coordinate only through the store: any number of them, in any
/// number of processes, may drain the same queue.
pub struct Worker {
    /// Attribution recorded in the processing index and Status Records.
    id: String,
    queue: Arc<QueueManager>,
    executor: Arc<dyn TaskExecutor>,
    shutdown_rx: broadcast::Receiver<()>,
    poll_timeout: Duration,
    error_backoff: Duration,
    lease_interval: Duration,
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
}

impl Worker {
    /// Creates a worker. It stops when `shutdown_rx` receives a message or its
    /// sender is dropped.
    pub fn new(
        id: impl Into<String>,
        queue: Arc<QueueManager>,
        executor: Arc<dyn TaskExecutor>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        let lease_interval = (queue.config().visibility_timeout / LEASE_RENEWALS_PER_TIMEOUT)
            .max(Duration::from_secs(1));
        Self {
            id: id.into(),
            queue,
            executor,
            shutdown_rx,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            error_backoff: DEFAULT_ERROR_BACKOFF,
            lease_interval,
            stats: Arc::new(SharedPoolStats::new()),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    /// How often a running task's lease is renewed. Defaults to a third of
    /// the queue's visibility timeout.
    pub fn with_lease_interval(mut self, interval: Duration) -> Self {
        self.lease_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub(crate) fn with_stats(mut self, stats: Arc<SharedPoolStats>) -> Self {
        self.stats = stats;
        self
    }

    /// Returns the worker's ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Main worker loop.
    ///
    /// Runs until shutdown. A task already dequeued is always run to the end
    /// and reported before the loop exits.
    pub async fn run(mut self) {
        self.metrics.inc_active_workers();
        info!(worker_id = %self.id, queue = %self.queue.queue_name(), "Worker started");

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(())
                | Err(broadcast::error::TryRecvError::Closed)
                | Err(broadcast::error::TryRecvError::Lagged(_)) => {
                    info!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            match self.run_once().await {
                Ok(_) => {}
                // Already logged and discarded by the queue manager.
                Err(QueueError::MalformedEnvelope { .. }) => {}
                Err(err) => {
                    error!(
                        worker_id = %self.id,
                        error = %err,
                        backoff_secs = self.error_backoff.as_secs_f64(),
                        "Worker loop error, backing off"
                    );
                    tokio::select! {
                        _ = self.shutdown_rx.recv() => {
                            info!(worker_id = %self.id, "Worker received shutdown signal");
                            break;
                        }
                        _ = tokio::time::sleep(self.error_backoff) => {}
                    }
                }
            }
        }

        self.metrics.dec_active_workers();
        info!(worker_id = %self.id, "Worker stopped");
    }

    /// One loop iteration: promote due retries, wait for a task, run it, report it.
    ///
    /// Returns `Ok(None)` when no task arrived within the poll timeout.
    pub async fn run_once(&self) -> Result<Option<CompletionOutcome>, QueueError> {
        if let Err(err) = self.queue.promote_due().await {
            debug!(worker_id = %self.id, error = %err, "Promoting due retries failed");
        }

        let Some(envelope) = self.queue.dequeue(&self.id, self.poll_timeout).await? else {
            return Ok(None);
        };
        self.process(envelope).await.map(Some)
    }

    async fn process(&self, envelope: TaskEnvelope) -> Result<CompletionOutcome, QueueError> {
        let task_type = envelope.kind();
        info!(
            worker_id = %self.id,
            task_id = %envelope.task_id,
            job_id = %envelope.job_id,
            task_type = %task_type,
            attempt = envelope.retry_count + 1,
            "Processing task"
        );

        self.stats.increment_active();
        self.metrics.inc_jobs_in_progress();
        let started = Instant::now();

        let handler = dispatch(self.executor.as_ref(), &envelope.task);
        tokio::pin!(handler);
        let mut lease = tokio::time::interval_at(
            tokio::time::Instant::now() + self.lease_interval,
            self.lease_interval,
        );
        lease.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let result = loop {
            tokio::select! {
                result = &mut handler => break result,
                _ = lease.tick() => self.renew_lease(&envelope.task_id).await,
            }
        };

        let duration = started.elapsed();
        self.stats.decrement_active();
        self.metrics.dec_jobs_in_progress();
        self.metrics.record_handler_duration(
            self.queue.queue_name(),
            task_type.as_str(),
            duration.as_secs_f64(),
        );

        if let Err(err) = &result {
            warn!(
                worker_id = %self.id,
                task_id = %envelope.task_id,
                retryable = err.retryable,
                error = %err,
                "Handler failed"
            );
        }

        let outcome = match self
            .queue
            .complete(&envelope.task_id, &envelope.job_id, result.into())
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(
                    worker_id = %self.id,
                    task_id = %envelope.task_id,
                    job_id = %envelope.job_id,
                    error = %err,
                    "Failed to report task outcome; the reaper will recover the task"
                );
                return Err(err);
            }
        };

        match &outcome {
            CompletionOutcome::Completed { .. } => self.stats.record_completion(duration),
            CompletionOutcome::Retrying { .. } => self.stats.record_failure(duration),
            CompletionOutcome::DeadLettered { .. } => self.stats.record_dead_letter(duration),
            CompletionOutcome::NotInFlight => warn!(
                worker_id = %self.id,
                task_id = %envelope.task_id,
                "Task was reclaimed before its outcome was reported"
            ),
        }
        debug!(
            worker_id = %self.id,
            task_id = %envelope.task_id,
            outcome = outcome.label(),
            duration_ms = duration.as_millis() as u64,
            "Task finished"
        );
        Ok(outcome)
    }

    async fn renew_lease(&self, task_id: &str) {
        match self.queue.touch_in_flight(task_id).await {
            Ok(true) => {}
            Ok(false) => warn!(
                worker_id = %self.id,
                task_id = %task_id,
                "Lease lost; the task was reclaimed while still running"
            ),
            Err(err) => warn!(
                worker_id = %self.id,
                task_id = %task_id,
                error = %err,
                "Failed to renew task lease"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::QueueConfig;
    use crate::error::HandlerError;
    use crate::queue::{
        JobState, MemoryBackend, TaskEnvelope, TaskOutput, TaskPayload, TranslatePayload,
    };
    use crate::worker::maintenance::{Maintenance, MaintenanceConfig};
    use crate::worker::handler::{EchoExecutor, HandlerResult};
    use async_trait::async_trait;

    struct FailingTranslator;

    #[async_trait]
    impl TaskExecutor for FailingTranslator {
        async fn translate(&self, _payload: &TranslatePayload) -> HandlerResult {
            Err(HandlerError::retryable("provider unavailable"))
        }
    }

    /// Signals when a translation starts and holds it until released.
    #[derive(Default)]
    struct GatedTranslator {
        started: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl TaskExecutor for GatedTranslator {
        async fn translate(&self, _payload: &TranslatePayload) -> HandlerResult {
            self.started.notify_one();
            self.release.notified().await;
            Ok(TaskOutput::complete(serde_json::json!({"text": "good morning"})))
        }
    }

    fn queue(clock: Arc<ManualClock>) -> Arc<QueueManager> {
        let backend = Arc::new(MemoryBackend::with_clock(clock.clone()));
        Arc::new(QueueManager::with_backend(
            QueueConfig::new("translation_jobs"),
            backend,
            clock,
        ))
    }

    fn translate(id: &str) -> TaskEnvelope {
        TaskEnvelope::new(
            "owner",
            TaskPayload::Translate(TranslatePayload {
                document_id: "doc".into(),
                content: "bonjour".into(),
                source_language: Some("fr".into()),
                target_language: "en".into(),
            }),
        )
        .with_task_id(id)
        .with_job_id(id)
    }

    #[tokio::test]
    async fn test_run_once_idle_returns_none() {
        let clock = Arc::new(ManualClock::default());
        let (_tx, rx) = broadcast::channel(1);
        let worker = Worker::new("w", queue(clock), Arc::new(EchoExecutor), rx)
            .with_poll_timeout(Duration::from_millis(10));

        assert_eq!(worker.run_once().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_run_once_completes_task() {
        let clock = Arc::new(ManualClock::default());
        let queue = queue(clock);
        queue.enqueue(translate("t1")).await.unwrap();

        let (_tx, rx) = broadcast::channel(1);
        let stats = Arc::new(SharedPoolStats::new());
        let worker = Worker::new("w", queue.clone(), Arc::new(EchoExecutor), rx)
            .with_poll_timeout(Duration::from_millis(10))
            .with_stats(stats.clone());

        let outcome = worker.run_once().await.unwrap();
        assert_eq!(outcome, Some(CompletionOutcome::Completed { partial: false }));
        assert_eq!(stats.to_pool_stats(1).jobs_completed, 1);
    }

    #[tokio::test]
    async fn test_worker_promotes_due_retry_before_dequeue() {
        let clock = Arc::new(ManualClock::default());
        let queue = queue(clock.clone());
        queue.enqueue(translate("t1")).await.unwrap();

        let (_tx, rx) = broadcast::channel(1);
        let worker = Worker::new("w", queue.clone(), Arc::new(FailingTranslator), rx)
            .with_poll_timeout(Duration::from_millis(10));

        let first = worker.run_once().await.unwrap();
        assert!(matches!(
            first,
            Some(CompletionOutcome::Retrying { retry_count: 1, .. })
        ));
        assert_eq!(worker.run_once().await.unwrap(), None);

        clock.advance(Duration::from_secs(60));
        let second = worker.run_once().await.unwrap();
        assert!(matches!(
            second,
            Some(CompletionOutcome::Retrying { retry_count: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let clock = Arc::new(ManualClock::default());
        let (tx, rx) = broadcast::channel(1);
        let worker = Worker::new("w", queue(clock), Arc::new(EchoExecutor), rx)
            .with_poll_timeout(Duration::from_millis(20));

        let handle = tokio::spawn(worker.run());
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("worker should stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_long_handler_keeps_lease_through_maintenance_sweep() {
        let clock = Arc::new(ManualClock::default());
        let queue = queue(clock.clone());
        queue.enqueue(translate("slow").with_max_retries(1)).await.unwrap();

        let executor = Arc::new(GatedTranslator::default());
        let (_tx, rx) = broadcast::channel(1);
        let worker = Worker::new("w", queue.clone(), executor.clone(), rx)
            .with_poll_timeout(Duration::from_millis(10))
            .with_lease_interval(Duration::from_millis(10));
        let running = tokio::spawn(async move { worker.run_once().await });

        executor.started.notified().await;
        // Well past the visibility timeout; the next renewal stamps the new time.
        clock.advance(queue.config().visibility_timeout + Duration::from_secs(60));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut maintenance = Maintenance::new(
            queue.clone(),
            MaintenanceConfig::for_queue(queue.config()),
        );
        let report = maintenance.sweep().await;
        assert_eq!(report.reaped, 0);

        executor.release.notify_one();
        let outcome = running.await.unwrap().unwrap();
        assert_eq!(outcome, Some(CompletionOutcome::Completed { partial: false }));

        let status = queue.get_status("slow").await.unwrap().unwrap();
        assert_eq!(status.status, JobState::Completed);
        assert!(queue.list_dead_letters(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_touch_after_reap_reports_lost_lease() {
        let clock = Arc::new(ManualClock::default());
        let queue = queue(clock.clone());
        queue.enqueue(translate("t1")).await.unwrap();
        queue
            .dequeue("w", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert!(queue.touch_in_flight("t1").await.unwrap());

        clock.advance(queue.config().visibility_timeout + Duration::from_secs(1));
        assert_eq!(queue.reap_stale(queue.config().visibility_timeout).await.unwrap(), 1);
        assert!(!queue.touch_in_flight("t1").await.unwrap());
    }
}
