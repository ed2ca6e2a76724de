//! folio-jobs: Redis-backed background job queue.
//!
//! API handlers submit long-running AI tasks (document editing, translation,
//! slide generation, PDF and image chapter ingestion, video export) through a
//! [`producer::Producer`]; pools of [`worker::Worker`]s drain the queues and
//! report results into per-job Status Records that polling clients read.
//! Delivery is at-least-once with exponential-backoff retries and a
//! dead-letter store for tasks that exhaust them.

// Core modules
pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod metrics;
pub mod producer;
pub mod queue;
pub mod worker;

// Re-export commonly used types
pub use config::{ConfigError, QueueConfig};
pub use error::{HandlerError, QueueError, StoreError};
pub use producer::{Producer, Submission};
pub use queue::{QueueManager, TaskEnvelope, TaskPayload};
pub use worker::{TaskExecutor, WorkerPool, WorkerPoolConfig};
