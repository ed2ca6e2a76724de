//! Redis-backed background job queue.
//!
//! Producers build a [`TaskEnvelope`] and hand it to [`QueueManager::enqueue`];
//! workers pull with [`QueueManager::dequeue`] and report back with
//! [`QueueManager::complete`]. Polling clients read [`StatusRecord`]s, a TTL-bound
//! side channel that never gates the queue itself.
//!
//! # Delivery
//!
//! Delivery is at-least-once. Every envelope sits in exactly one of the
//! pending list, the processing index, the delayed-retry set or the
//! dead-letter store, and each transition between them is one atomic store
//! operation. A worker that dies mid-task leaves its entry in the processing
//! index until [`QueueManager::reap_stale`] takes it back, so handlers must
//! tolerate running the same task twice.
//!
//! # Retries
//!
//! Failed attempts wait in a delayed set for
//! `min(max_delay, base_delay * 2^(retry_count - 1))` before
//! [`QueueManager::promote_due`] returns them to the queue. A task that fails
//! with `retry_count == max_retries` (or with a non-retryable error) lands in
//! the dead-letter store and its status becomes `failed`.

mod backend;
mod dead_letter;
mod envelope;
mod keys;
mod manager;
mod outcome;
mod retry;
mod status;

pub use backend::{ListEnd, MemoryBackend, QueueBackend, RedisBackend, Transfer};
pub use dead_letter::DeadLetterEntry;
pub use envelope::{
    BilingualDocumentPayload, EditDocumentPayload, ExportVideoPayload, FormatDocumentPayload,
    GenerateSlidesPayload, ImageToChapterPayload, PdfToPagesPayload, TaskEnvelope, TaskKind,
    TaskPayload, TranslatePayload, PRIORITY_HIGH, PRIORITY_NORMAL,
};
pub use keys::QueueKeys;
pub use manager::{LifetimeCounters, QueueManager, QueueStats};
pub use outcome::{CompletionOutcome, TaskOutcome, TaskOutput};
pub use retry::{FailureAction, RetryPolicy};
pub use status::{JobState, StatusRecord, StatusUpdate};
