//! Worker pool for processing tasks from one or more queues.
//!
//! Each queue gets its own set of workers plus one maintenance loop. All of
//! them run as independent async tasks and stop on a shared broadcast signal.
//!
//! # Features
//!
//! - Configurable number of workers per queue
//! - Several queue-names served by one process
//! - Graceful shutdown: in-flight tasks finish before workers exit
//! - Pool statistics tracking

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::handler::TaskExecutor;
use super::maintenance::{Maintenance, MaintenanceConfig};
use super::runner::{Worker, DEFAULT_ERROR_BACKOFF, DEFAULT_POLL_TIMEOUT};
use crate::queue::QueueManager;

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Worker pool has no queues to serve")]
    NoQueues,

    #[error("Pool is already running")]
    AlreadyRunning,

    #[error("Pool is not running")]
    NotRunning,

    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Configuration for the worker pool.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerPoolConfig {
    /// Number of competing workers spawned for each queue.
    pub workers_per_queue: usize,
    /// How long a blocking dequeue waits before the loop re-checks for shutdown.
    pub poll_timeout: Duration,
    /// Pause after a worker loop error such as a lost connection.
    pub error_backoff: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
    /// Whether to run a maintenance loop per queue.
    pub run_maintenance: bool,
    /// Tick of the maintenance loop.
    pub maintenance_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers_per_queue: 4,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            error_backoff: DEFAULT_ERROR_BACKOFF,
            shutdown_timeout: Duration::from_secs(60),
            run_maintenance: true,
            maintenance_interval: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the specified number of workers per queue.
    pub fn new(workers_per_queue: usize) -> Self {
        Self {
            workers_per_queue,
            ..Default::default()
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

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_maintenance(mut self, enabled: bool) -> Self {
        self.run_maintenance = enabled;
        self
    }

    pub fn with_maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval;
        self
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers currently running a handler.
    pub active_workers: usize,
    pub jobs_completed: u64,
    /// Failed attempts that were scheduled for retry.
    pub jobs_failed: u64,
    pub jobs_dead_lettered: u64,
    /// Average handler duration over all reported attempts.
    pub average_job_duration: Duration,
}

impl PoolStats {
    /// Returns the number of attempts processed by this pool.
    pub fn total_processed(&self) -> u64 {
        self.jobs_completed + self.jobs_failed + self.jobs_dead_lettered
    }

    /// Returns the share of attempts that completed, as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.jobs_completed as f64 / total as f64) * 100.0
    }
}

/// Counters shared by all workers of a pool.
#[derive(Debug, Default)]
pub(crate) struct SharedPoolStats {
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_dead_lettered: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn add_duration(&self, duration: Duration) {
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    pub(crate) fn record_completion(&self, duration: Duration) {
        self.jobs_completed.fetch_add(1, Ordering::SeqCst);
        self.add_duration(duration);
    }

    pub(crate) fn record_failure(&self, duration: Duration) {
        self.jobs_failed.fetch_add(1, Ordering::SeqCst);
        self.add_duration(duration);
    }

    pub(crate) fn record_dead_letter(&self, duration: Duration) {
        self.jobs_dead_lettered.fetch_add(1, Ordering::SeqCst);
        self.add_duration(duration);
    }

    pub(crate) fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let completed = self.jobs_completed.load(Ordering::SeqCst);
        let failed = self.jobs_failed.load(Ordering::SeqCst);
        let dead_lettered = self.jobs_dead_lettered.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);
        let active = self.active_workers.load(Ordering::SeqCst);

        let total_jobs = completed + failed + dead_lettered;
        let average_duration = if total_jobs > 0 {
            Duration::from_millis(total_duration_ms / total_jobs)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: active as usize,
            jobs_completed: completed,
            jobs_failed: failed,
            jobs_dead_lettered: dead_lettered,
            average_job_duration: average_duration,
        }
    }
}

/// Pool of workers serving one or more queues.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    queues: Vec<Arc<QueueManager>>,
    executor: Arc<dyn TaskExecutor>,
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    is_running: AtomicBool,
}

impl WorkerPool {
    /// Creates a pool; nothing runs until [`start`](Self::start).
    pub fn new(
        config: WorkerPoolConfig,
        queues: Vec<Arc<QueueManager>>,
        executor: Arc<dyn TaskExecutor>,
    ) -> Self {
        // Only one message is ever sent.
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            queues,
            executor,
            shutdown_tx,
            handles: Vec::new(),
            stats: Arc::new(SharedPoolStats::new()),
            is_running: AtomicBool::new(false),
        }
    }

    /// Spawns the workers and maintenance loops.
    ///
    /// # Errors
    ///
    /// - `PoolError::AlreadyRunning` if the pool is already running
    /// - `PoolError::NoQueues` if the pool was built without queues
    pub async fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }
        if self.queues.is_empty() {
            return Err(PoolError::NoQueues);
        }

        let pid = std::process::id();
        for queue in &self.queues {
            if self.config.run_maintenance {
                let maintenance = Maintenance::new(
                    Arc::clone(queue),
                    MaintenanceConfig::for_queue(queue.config())
                        .with_interval(self.config.maintenance_interval),
                );
                let shutdown_rx = self.shutdown_tx.subscribe();
                self.handles
                    .push(tokio::spawn(maintenance.run(shutdown_rx)));
            }

            for i in 0..self.config.workers_per_queue {
                let worker = Worker::new(
                    format!("{}-{}-{}", queue.queue_name(), pid, i),
                    Arc::clone(queue),
                    Arc::clone(&self.executor),
                    self.shutdown_tx.subscribe(),
                )
                .with_poll_timeout(self.config.poll_timeout)
                .with_error_backoff(self.config.error_backoff)
                .with_stats(Arc::clone(&self.stats));

                self.handles.push(tokio::spawn(worker.run()));
            }

            info!(
                queue = %queue.queue_name(),
                workers = self.config.workers_per_queue,
                maintenance = self.config.run_maintenance,
                "Queue workers started"
            );
        }

        self.is_running.store(true, Ordering::SeqCst);
        info!(
            queues = self.queues.len(),
            num_workers = self.num_workers(),
            "Worker pool started"
        );

        Ok(())
    }

    /// Gracefully shuts down all workers.
    ///
    /// Workers finish the task they are running, report it, and exit.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if workers don't stop within
    /// the configured timeout.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");

        // Workers may already be gone.
        let _ = self.shutdown_tx.send(());

        let handles: Vec<_> = self.handles.drain(..).collect();
        let shutdown_future = async {
            for handle in handles {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        let result = tokio::time::timeout(self.config.shutdown_timeout, shutdown_future).await;
        self.is_running.store(false, Ordering::SeqCst);
        match result {
            Ok(()) => {
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.num_workers())
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Total workers across all queues.
    pub fn num_workers(&self) -> usize {
        self.config.workers_per_queue * self.queues.len()
    }

    pub fn queues(&self) -> &[Arc<QueueManager>] {
        &self.queues
    }
}
