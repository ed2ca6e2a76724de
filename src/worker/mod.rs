//! Workers that drain queues and run task handlers.
//!
//! - [`TaskExecutor`] / [`dispatch`]: the seam between the queue and business logic
//! - [`Worker`]: one dequeue-run-report loop
//! - [`WorkerPool`]: many workers over one or more queues, with graceful shutdown
//! - [`Maintenance`]: retry promotion, stale-task reaping and status cleanup

mod handler;
mod maintenance;
mod pool;
mod runner;

pub use handler::{dispatch, EchoExecutor, HandlerResult, TaskExecutor};
pub use maintenance::{Maintenance, MaintenanceConfig, SweepReport};
pub use pool::{PoolError, PoolStats, WorkerPool, WorkerPoolConfig};
pub use runner::{Worker, DEFAULT_ERROR_BACKOFF, DEFAULT_POLL_TIMEOUT};
