//! Storage primitives behind the Queue Manager.
//!
//! The Queue Manager's logic is written once against [`QueueBackend`]; each
//! method is a single atomic step in the backing store. Multi-key moves
//! (`move_item`, `retire`, `promote_due`, `index_claimed`) are atomic as a
//! whole, which keeps every envelope in exactly one of
//! {pending, claimed, processing, delayed, dead-letter} at any time.
//!
//! - [`RedisBackend`]: production store
//! - [`MemoryBackend`]: in-process store with the same semantics

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

mod memory;
mod redis_store;

pub use self::memory::MemoryBackend;
pub use self::redis_store::RedisBackend;

/// Which end of a list to insert at. The head (front) is popped first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListEnd {
    Front,
    Back,
}

impl ListEnd {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            ListEnd::Front => "front",
            ListEnd::Back => "back",
        }
    }
}

/// Where an in-flight entry goes when it is retired from the processing index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer<'a> {
    /// Nothing further to store.
    Drop,
    /// Push `value` onto `list`.
    Push {
        list: &'a str,
        value: &'a str,
        end: ListEnd,
    },
    /// Add `value` to the delayed set `zset`, due at `due_at_ms` (unix millis).
    Delay {
        zset: &'a str,
        value: &'a str,
        due_at_ms: i64,
    },
}

/// Atomic storage operations used by the Queue Manager.
#[async_trait]
pub trait QueueBackend: Send + Sync + std::fmt::Debug {
    /// Endpoint description for logs and errors.
    fn describe(&self) -> String;

    /// Round-trip liveness check.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Writes and deletes `key`, failing with [`StoreError::ReadOnly`] on a replica.
    async fn probe_write(&self, key: &str) -> Result<(), StoreError>;

    /// Pushes `value` and returns the new list length.
    async fn push(&self, list: &str, value: &str, end: ListEnd) -> Result<usize, StoreError>;

    /// Pushes several values in one atomic step.
    async fn push_batch(&self, list: &str, values: &[(String, ListEnd)])
        -> Result<usize, StoreError>;

    /// Waits up to `timeout` for the head of `src`, moving it to the tail of `dst`.
    ///
    /// Each element is delivered to exactly one caller.
    async fn blocking_move(
        &self,
        src: &str,
        dst: &str,
        timeout: Duration,
    ) -> Result<Option<String>, StoreError>;

    async fn list_len(&self, list: &str) -> Result<usize, StoreError>;

    /// Inclusive range, negative indexes count from the tail.
    async fn list_range(&self, list: &str, start: isize, stop: isize)
        -> Result<Vec<String>, StoreError>;

    /// Removes one occurrence of `value`; returns how many were removed.
    async fn list_remove(&self, list: &str, value: &str) -> Result<usize, StoreError>;

    /// Removes one occurrence of `value` from `src` and, only if it was present,
    /// pushes `replacement` onto `dst`. Returns whether the move happened.
    async fn move_item(
        &self,
        src: &str,
        value: &str,
        dst: &str,
        replacement: &str,
        end: ListEnd,
    ) -> Result<bool, StoreError>;

    /// Records `record` under `index[field]` and removes `raw` from `claimed`.
    async fn index_claimed(
        &self,
        claimed: &str,
        raw: &str,
        index: &str,
        field: &str,
        record: &str,
    ) -> Result<(), StoreError>;

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;

    async fn hash_len(&self, key: &str) -> Result<usize, StoreError>;

    /// All fields of a hash; empty when the key is absent or expired.
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    async fn hash_incr(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError>;

    /// Deletes `index[field]` and, only if it existed, applies `then`.
    ///
    /// Returns whether the field existed, so concurrent callers racing on the
    /// same entry see exactly one `true`.
    async fn retire(&self, index: &str, field: &str, then: Transfer<'_>)
        -> Result<bool, StoreError>;

    /// Sets `key[field]` to `value` only if it currently holds `expected`.
    ///
    /// Returns whether the swap happened; a missing field never matches.
    async fn hash_compare_and_set(
        &self,
        key: &str,
        field: &str,
        expected: &str,
        value: &str,
    ) -> Result<bool, StoreError>;

    /// Deletes `remove`, sets `set`, and resets the key's TTL to `ttl`.
    async fn hash_merge(
        &self,
        key: &str,
        set: &[(String, String)],
        remove: &[String],
        ttl: Duration,
    ) -> Result<(), StoreError>;

    /// Deletes a key; returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Every live key starting with `prefix`.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    async fn delayed_len(&self, zset: &str) -> Result<usize, StoreError>;

    /// Moves up to `limit` members of `zset` due at or before `now_ms` onto
    /// `list` (front for priority envelopes, back otherwise). Returns how many
    /// moved.
    async fn promote_due(
        &self,
        zset: &str,
        list: &str,
        now_ms: i64,
        limit: usize,
    ) -> Result<usize, StoreError>;
}
