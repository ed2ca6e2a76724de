//! Command-line interface for folio-jobs.
//!
//! Provides commands for running workers, enqueueing tasks, and inspecting
//! and repairing queues.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli};
