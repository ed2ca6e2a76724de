//! Periodic housekeeping for one queue.
//!
//! A sweep promotes due retries, reaps tasks whose worker went silent,
//! requeues orphaned claims and, less often, deletes old Status Records.
//! Every step is best-effort: a failing step is logged and the next one
//! still runs. Several processes may sweep the same queue concurrently.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::queue::QueueManager;

/// Settings for a [`Maintenance`] loop.
#[derive(Debug, Clone, PartialEq)]
pub struct MaintenanceConfig {
    /// Time between sweeps.
    pub interval: Duration,
    /// In-flight age after which a task is reaped.
    pub visibility_timeout: Duration,
    /// Status Records created longer ago than this are deleted.
    pub status_max_age: Duration,
    /// Minimum time between two status cleanups.
    pub cleanup_interval: Duration,
}

impl MaintenanceConfig {
    /// Derives thresholds from the queue's own configuration.
    pub fn for_queue(config: &QueueConfig) -> Self {
        Self {
            interval: Duration::from_secs(30),
            visibility_timeout: config.visibility_timeout,
            status_max_age: config.status_retention,
            cleanup_interval: Duration::from_secs(3600),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub promoted: usize,
    pub reaped: usize,
    pub orphans_requeued: usize,
    pub statuses_removed: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Housekeeping loop for one queue.
pub struct Maintenance {
    queue: Arc<QueueManager>,
    config: MaintenanceConfig,
    /// Claimed items seen at the previous sweep.
    suspects: HashSet<String>,
    last_cleanup: Option<Instant>,
}

impl Maintenance {
    pub fn new(queue: Arc<QueueManager>, config: MaintenanceConfig) -> Self {
        Self {
            queue,
            config,
            suspects: HashSet::new(),
            last_cleanup: None,
        }
    }

    /// Runs every housekeeping step once.
    pub async fn sweep(&mut self) -> SweepReport {
        let queue_name = self.queue.queue_name().to_string();
        let mut report = SweepReport::default();

        match self.queue.promote_due().await {
            Ok(n) => report.promoted = n,
            Err(err) => warn!(queue = %queue_name, error = %err, "Promoting due retries failed"),
        }

        match self.queue.reap_stale(self.config.visibility_timeout).await {
            Ok(n) => report.reaped = n,
            Err(err) => warn!(queue = %queue_name, error = %err, "Reaping stale tasks failed"),
        }

        match self.queue.recover_orphans(&mut self.suspects).await {
            Ok(n) => report.orphans_requeued = n,
            Err(err) => warn!(queue = %queue_name, error = %err, "Recovering orphaned claims failed"),
        }

        let cleanup_due = self
            .last_cleanup
            .map_or(true, |at| at.elapsed() >= self.config.cleanup_interval);
        if cleanup_due {
            match self
                .queue
                .cleanup_old_statuses(self.config.status_max_age)
                .await
            {
                Ok(n) => {
                    report.statuses_removed = n;
                    self.last_cleanup = Some(Instant::now());
                }
                Err(err) => warn!(queue = %queue_name, error = %err, "Status cleanup failed"),
            }
        }

        // Refreshes the depth gauges.
        if let Err(err) = self.queue.get_stats().await {
            debug!(queue = %queue_name, error = %err, "Collecting queue stats failed");
        }

        report
    }

    /// Sweeps on every tick until `shutdown_rx` fires. The first sweep runs immediately.
    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            queue = %self.queue.queue_name(),
            interval_secs = self.config.interval.as_secs_f64(),
            "Maintenance loop started"
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = ticker.tick() => {
                    let report = self.sweep().await;
                    if !report.is_empty() {
                        info!(
                            queue = %self.queue.queue_name(),
                            promoted = report.promoted,
                            reaped = report.reaped,
                            orphans_requeued = report.orphans_requeued,
                            statuses_removed = report.statuses_removed,
                            "Maintenance sweep"
                        );
                    }
                }
            }
        }

        info!(queue = %self.queue.queue_name(), "Maintenance loop stopped");
    }
}
