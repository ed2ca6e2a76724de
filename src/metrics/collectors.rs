//! High-level recording interface over the raw Prometheus metrics.
//!
//! `MetricsCollector` keeps label usage consistent across the queue manager
//! and the workers. Every method is a no-op until `init_metrics()` has run.

use super::prometheus::{
    ACTIVE_WORKERS, HANDLER_DURATION, JOBS_IN_PROGRESS, QUEUE_DEPTH, TASKS_ENQUEUED, TASKS_TOTAL,
};

/// Snapshot of one queue's storage areas, as published to the depth gauge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepths {
    pub pending: usize,
    pub delayed: usize,
    pub processing: usize,
    pub dead_letter: usize,
}

/// Metrics collector for recording queue and worker metrics.
///
/// # Example
///
/// ```ignore
/// use folio_jobs::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.record_enqueued("translation_jobs", "translate", 1);
/// collector.record_outcome("translation_jobs", "completed");
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record tasks accepted onto `queue`.
    pub fn record_enqueued(&self, queue: &str, task_type: &str, count: u64) {
        if let Some(enqueued) = TASKS_ENQUEUED.get() {
            enqueued
                .with_label_values(&[queue, task_type])
                .inc_by(count as f64);
        }

        tracing::trace!(queue, task_type, count, "Recorded enqueue metric");
    }

    /// Record a lifecycle outcome (see [`CompletionOutcome::label`](crate::queue::CompletionOutcome::label)).
    pub fn record_outcome(&self, queue: &str, outcome: &str) {
        self.record_outcomes(queue, outcome, 1);
    }

    pub fn record_outcomes(&self, queue: &str, outcome: &str, count: u64) {
        if count == 0 {
            return;
        }
        if let Some(tasks_total) = TASKS_TOTAL.get() {
            tasks_total
                .with_label_values(&[queue, outcome])
                .inc_by(count as f64);
        }

        tracing::trace!(queue, outcome, count, "Recorded task outcome metric");
    }

    /// Record how long a handler ran.
    pub fn record_handler_duration(&self, queue: &str, task_type: &str, duration_secs: f64) {
        if let Some(duration) = HANDLER_DURATION.get() {
            duration
                .with_label_values(&[queue, task_type])
                .observe(duration_secs);
        }
    }

    /// Publish the current size of each storage area of `queue`.
    pub fn update_queue_depths(&self, queue: &str, depths: QueueDepths) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            for (state, value) in [
                ("pending", depths.pending),
                ("delayed", depths.delayed),
                ("processing", depths.processing),
                ("dead_letter", depths.dead_letter),
            ] {
                queue_depth
                    .with_label_values(&[queue, state])
                    .set(value as f64);
            }
        }

        tracing::trace!(
            queue,
            pending = depths.pending,
            delayed = depths.delayed,
            processing = depths.processing,
            dead_letter = depths.dead_letter,
            "Updated queue depth metrics"
        );
    }

    pub fn inc_active_workers(&self) {
        if let Some(active_workers) = ACTIVE_WORKERS.get() {
            active_workers.inc();
        }
    }

    pub fn dec_active_workers(&self) {
        if let Some(active_workers) = ACTIVE_WORKERS.get() {
            active_workers.dec();
        }
    }

    pub fn inc_jobs_in_progress(&self) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.inc();
        }
    }

    pub fn dec_jobs_in_progress(&self) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.dec();
        }
    }
}
