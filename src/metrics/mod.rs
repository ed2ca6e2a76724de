//! Metrics module for Prometheus-based monitoring.
//!
//! Metrics are an observability side channel: recording never fails and never
//! sits on the enqueue/complete durability path.
//!
//! # Example
//!
//! ```ignore
//! use folio_jobs::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_outcome("ai_editor", "completed");
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{MetricsCollector, QueueDepths};
pub use self::prometheus::{export_metrics, init_metrics};

pub use self::prometheus::{
    ACTIVE_WORKERS, HANDLER_DURATION, JOBS_IN_PROGRESS, QUEUE_DEPTH, REGISTRY, TASKS_ENQUEUED,
    TASKS_TOTAL,
};
