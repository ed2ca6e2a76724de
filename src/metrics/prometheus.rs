//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by folio-jobs and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all folio-jobs metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Tasks accepted onto a queue, labeled by queue and task type.
pub static TASKS_ENQUEUED: OnceLock<CounterVec> = OnceLock::new();

/// Task lifecycle outcomes, labeled by queue and outcome
/// (completed, partial_success, retrying, dead_lettered, malformed, reaped).
pub static TASKS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Handler execution time in seconds, labeled by queue and task type.
pub static HANDLER_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Number of tasks per queue and storage area (pending, delayed, processing, dead_letter).
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Number of tasks whose handler is running in this process.
pub static JOBS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Number of active workers in this process.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Recording before this is a no-op.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let tasks_enqueued = CounterVec::new(
        Opts::new("folio_jobs_tasks_enqueued_total", "Tasks accepted onto a queue"),
        &["queue", "task_type"],
    )?;

    let tasks_total = CounterVec::new(
        Opts::new("folio_jobs_tasks_total", "Task lifecycle outcomes"),
        &["queue", "outcome"],
    )?;

    // Handlers call out to AI providers and media tooling, so the tail is long.
    let handler_duration = HistogramVec::new(
        HistogramOpts::new(
            "folio_jobs_handler_duration_seconds",
            "Task handler execution time in seconds",
        )
        .buckets(vec![0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 900.0]),
        &["queue", "task_type"],
    )?;

    let queue_depth = GaugeVec::new(
        Opts::new("folio_jobs_queue_depth", "Tasks per queue and storage area"),
        &["queue", "state"],
    )?;

    let jobs_in_progress = Gauge::new(
        "folio_jobs_jobs_in_progress",
        "Tasks whose handler is currently running",
    )?;

    let active_workers = Gauge::new("folio_jobs_active_workers", "Number of active workers")?;

    registry.register(Box::new(tasks_enqueued.clone()))?;
    registry.register(Box::new(tasks_total.clone()))?;
    registry.register(Box::new(handler_duration.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(jobs_in_progress.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;

    // A second call leaves the first registration in place.
    let _ = REGISTRY.set(registry);
    let _ = TASKS_ENQUEUED.set(tasks_enqueued);
    let _ = TASKS_TOTAL.set(tasks_total);
    let _ = HANDLER_DURATION.set(handler_duration);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = JOBS_IN_PROGRESS.set(jobs_in_progress);
    let _ = ACTIVE_WORKERS.set(active_workers);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns an explanatory comment line instead when the registry has not been
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
