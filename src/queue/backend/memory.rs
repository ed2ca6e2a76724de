//! In-process implementation of [`QueueBackend`].
//!
//! Every operation takes one lock over the whole store, so each call is
//! atomic the same way a Redis command or Lua script is. Hash TTLs expire
//! lazily against the injected [`Clock`]. Blocking pops wait on a [`Notify`]
//! that every push signals.
//!
//! Used by the test suite and by single-process setups without Redis.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::Notify;

use super::{ListEnd, QueueBackend, Transfer};
use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;
use crate::queue::envelope::raw_is_priority;

#[derive(Debug, Default)]
struct StoredHash {
    fields: HashMap<String, String>,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct State {
    lists: HashMap<String, VecDeque<String>>,
    hashes: HashMap<String, StoredHash>,
    zsets: HashMap<String, Vec<(i64, String)>>,
    strings: HashMap<String, String>,
}

impl State {
    fn purge_expired(&mut self, now: DateTime<Utc>) {
        self.hashes
            .retain(|_, hash| hash.expires_at.map_or(true, |at| at > now));
    }

    fn live_hash(&mut self, key: &str, now: DateTime<Utc>) -> Option<&mut StoredHash> {
        let expired = self
            .hashes
            .get(key)
            .and_then(|hash| hash.expires_at)
            .is_some_and(|at| at <= now);
        if expired {
            self.hashes.remove(key);
            return None;
        }
        self.hashes.get_mut(key)
    }

    fn push(&mut self, list: &str, value: String, end: ListEnd) -> usize {
        let items = self.lists.entry(list.to_string()).or_default();
        match end {
            ListEnd::Front => items.push_front(value),
            ListEnd::Back => items.push_back(value),
        }
        items.len()
    }

    fn remove_one(&mut self, list: &str, value: &str) -> bool {
        let Some(items) = self.lists.get_mut(list) else {
            return false;
        };
        match items.iter().position(|item| item == value) {
            Some(index) => {
                items.remove(index);
                true
            }
            None => false,
        }
    }

    fn zadd(&mut self, zset: &str, score: i64, value: String) {
        let members = self.zsets.entry(zset.to_string()).or_default();
        members.retain(|(_, member)| *member != value);
        members.push((score, value));
    }
}

/// In-memory queue store.
#[derive(Debug)]
pub struct MemoryBackend {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
    pushed: Notify,
    unavailable: AtomicBool,
    read_only: AtomicBool,
    rejecting_pushes: AtomicBool,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Store whose TTLs follow `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock,
            pushed: Notify::new(),
            unavailable: AtomicBool::new(false),
            read_only: AtomicBool::new(false),
            rejecting_pushes: AtomicBool::new(false),
        }
    }

    /// Makes every subsequent call fail as if the server were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Makes writes fail as on a read-only replica.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    /// Makes list pushes fail with a connection error while everything else works.
    pub fn set_rejecting_pushes(&self, rejecting: bool) {
        self.rejecting_pushes.store(rejecting, Ordering::SeqCst);
    }

    fn check_pushable(&self) -> Result<(), StoreError> {
        self.check_writable()?;
        if self.rejecting_pushes.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("connection reset during push".to_string()));
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_reachable(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Connection(
                "memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        self.check_reachable()?;
        if self.read_only.load(Ordering::SeqCst) {
            return Err(StoreError::ReadOnly(
                "READONLY You can't write against a read only replica.".to_string(),
            ));
        }
        Ok(())
    }

    fn try_move(&self, src: &str, dst: &str) -> Option<String> {
        let mut state = self.lock();
        let value = state.lists.get_mut(src)?.pop_front()?;
        state.push(dst, value.clone(), ListEnd::Back);
        Some(value)
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    fn describe(&self) -> String {
        "memory://".to_string()
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check_reachable()
    }

    async fn probe_write(&self, key: &str) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut state = self.lock();
        state.strings.insert(key.to_string(), "1".to_string());
        state.strings.remove(key);
        Ok(())
    }

    async fn push(&self, list: &str, value: &str, end: ListEnd) -> Result<usize, StoreError> {
        self.check_pushable()?;
        let len = self.lock().push(list, value.to_string(), end);
        self.pushed.notify_waiters();
        Ok(len)
    }

    async fn push_batch(
        &self,
        list: &str,
        values: &[(String, ListEnd)],
    ) -> Result<usize, StoreError> {
        self.check_pushable()?;
        let len = {
            let mut state = self.lock();
            let mut len = state.lists.get(list).map_or(0, VecDeque::len);
            for (value, end) in values {
                len = state.push(list, value.clone(), *end);
            }
            len
        };
        self.pushed.notify_waiters();
        Ok(len)
    }

    async fn blocking_move(
        &self,
        src: &str,
        dst: &str,
        timeout: Duration,
    ) -> Result<Option<String>, StoreError> {
        self.check_writable()?;
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            // Register before checking so a push between the check and the
            // wait is not missed.
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = self.try_move(src, dst) {
                return Ok(Some(value));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
            self.check_writable()?;
        }
    }

    async fn list_len(&self, list: &str) -> Result<usize, StoreError> {
        self.check_reachable()?;
        Ok(self.lock().lists.get(list).map_or(0, VecDeque::len))
    }

    async fn list_range(
        &self,
        list: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError> {
        self.check_reachable()?;
        let state = self.lock();
        let Some(items) = state.lists.get(list) else {
            return Ok(Vec::new());
        };

        let len = items.len() as isize;
        let start = if start < 0 { (start + len).max(0) } else { start };
        let stop = if stop < 0 { stop + len } else { stop.min(len - 1) };
        if start > stop || start >= len {
            return Ok(Vec::new());
        }

        Ok(items
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .cloned()
            .collect())
    }

    async fn list_remove(&self, list: &str, value: &str) -> Result<usize, StoreError> {
        self.check_writable()?;
        Ok(usize::from(self.lock().remove_one(list, value)))
    }

    async fn move_item(
        &self,
        src: &str,
        value: &str,
        dst: &str,
        replacement: &str,
        end: ListEnd,
    ) -> Result<bool, StoreError> {
        self.check_writable()?;
        let moved = {
            let mut state = self.lock();
            if state.remove_one(src, value) {
                state.push(dst, replacement.to_string(), end);
                true
            } else {
                false
            }
        };
        if moved {
            self.pushed.notify_waiters();
        }
        Ok(moved)
    }

    async fn index_claimed(
        &self,
        claimed: &str,
        raw: &str,
        index: &str,
        field: &str,
        record: &str,
    ) -> Result<(), StoreError> {
        self.check_writable()?;
        let now = self.clock.now();
        let mut state = self.lock();
        if state.live_hash(index, now).is_none() {
            state.hashes.insert(index.to_string(), StoredHash::default());
        }
        if let Some(hash) = state.hashes.get_mut(index) {
            hash.fields.insert(field.to_string(), record.to_string());
        }
        state.remove_one(claimed, raw);
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        self.check_reachable()?;
        let now = self.clock.now();
        let mut state = self.lock();
        Ok(state
            .live_hash(key, now)
            .and_then(|hash| hash.fields.get(field).cloned()))
    }

    async fn hash_len(&self, key: &str) -> Result<usize, StoreError> {
        self.check_reachable()?;
        let now = self.clock.now();
        let mut state = self.lock();
        Ok(state.live_hash(key, now).map_or(0, |hash| hash.fields.len()))
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.check_reachable()?;
        let now = self.clock.now();
        let mut state = self.lock();
        Ok(state
            .live_hash(key, now)
            .map(|hash| hash.fields.clone())
            .unwrap_or_default())
    }

    async fn hash_incr(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError> {
        self.check_writable()?;
        let now = self.clock.now();
        let mut state = self.lock();
        if state.live_hash(key, now).is_none() {
            state.hashes.insert(key.to_string(), StoredHash::default());
        }
        let Some(hash) = state.hashes.get_mut(key) else {
            return Err(StoreError::Command(format!("hash {} vanished", key)));
        };

        let current = match hash.fields.get(field) {
            Some(raw) => raw.parse::<i64>().map_err(|_| {
                StoreError::Command(format!("hash value {}[{}] is not an integer", key, field))
            })?,
            None => 0,
        };
        let next = current + delta;
        hash.fields.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn retire(
        &self,
        index: &str,
        field: &str,
        then: Transfer<'_>,
    ) -> Result<bool, StoreError> {
        self.check_writable()?;
        let now = self.clock.now();
        let pushed = {
            let mut state = self.lock();
            let removed = state
                .live_hash(index, now)
                .and_then(|hash| hash.fields.remove(field))
                .is_some();
            if !removed {
                return Ok(false);
            }

            match then {
                Transfer::Drop => false,
                Transfer::Push { list, value, end } => {
                    state.push(list, value.to_string(), end);
                    true
                }
                Transfer::Delay {
                    zset,
                    value,
                    due_at_ms,
                } => {
                    state.zadd(zset, due_at_ms, value.to_string());
                    false
                }
            }
        };
        if pushed {
            self.pushed.notify_waiters();
        }
        Ok(true)
    }

    async fn hash_compare_and_set(
        &self,
        key: &str,
        field: &str,
        expected: &str,
        value: &str,
    ) -> Result<bool, StoreError> {
        self.check_writable()?;
        let now = self.clock.now();
        let mut state = self.lock();
        let Some(current) = state
            .live_hash(key, now)
            .and_then(|hash| hash.fields.get_mut(field))
        else {
            return Ok(false);
        };
        if current.as_str() != expected {
            return Ok(false);
        }
        *current = value.to_string();
        Ok(true)
    }

    async fn hash_merge(
        &self,
        key: &str,
        set: &[(String, String)],
        remove: &[String],
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.check_writable()?;
        let now = self.clock.now();
        let ttl = ChronoDuration::from_std(ttl).unwrap_or(ChronoDuration::MAX);
        let mut state = self.lock();

        if state.live_hash(key, now).is_none() {
            state.hashes.insert(key.to_string(), StoredHash::default());
        }
        let Some(hash) = state.hashes.get_mut(key) else {
            return Ok(());
        };
        for field in remove {
            hash.fields.remove(field);
        }
        for (field, value) in set {
            hash.fields.insert(field.clone(), value.clone());
        }
        hash.expires_at = now.checked_add_signed(ttl);

        if hash.fields.is_empty() {
            state.hashes.remove(key);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.check_writable()?;
        let now = self.clock.now();
        let mut state = self.lock();
        let live_hash = state.live_hash(key, now).is_some();
        let removed = (live_hash && state.hashes.remove(key).is_some())
            | state.lists.remove(key).is_some_and(|items| !items.is_empty())
            | state.zsets.remove(key).is_some_and(|members| !members.is_empty())
            | state.strings.remove(key).is_some();
        Ok(removed)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.check_reachable()?;
        let now = self.clock.now();
        let mut state = self.lock();
        state.purge_expired(now);

        let mut keys: Vec<String> = state
            .hashes
            .keys()
            .chain(state.lists.keys())
            .chain(state.zsets.keys())
            .chain(state.strings.keys())
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort_unstable();
        keys.dedup();
        Ok(keys)
    }

    async fn delayed_len(&self, zset: &str) -> Result<usize, StoreError> {
        self.check_reachable()?;
        Ok(self.lock().zsets.get(zset).map_or(0, Vec::len))
    }

    async fn promote_due(
        &self,
        zset: &str,
        list: &str,
        now_ms: i64,
        limit: usize,
    ) -> Result<usize, StoreError> {
        self.check_writable()?;
        let moved = {
            let mut state = self.lock();
            let Some(members) = state.zsets.get_mut(zset) else {
                return Ok(0);
            };

            members.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
            let due = members
                .iter()
                .take_while(|(score, _)| *score <= now_ms)
                .count()
                .min(limit.max(1));
            let promoted: Vec<String> = members.drain(..due).map(|(_, raw)| raw).collect();

            for raw in &promoted {
                let end = if raw_is_priority(raw) {
                    ListEnd::Front
                } else {
                    ListEnd::Back
                };
                state.push(list, raw.clone(), end);
            }
            promoted.len()
        };
        if moved > 0 {
            self.pushed.notify_waiters();
        }
        Ok(moved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[tokio::test]
    async fn test_blocking_move_times_out_when_empty() {
        let store = MemoryBackend::new();
        let popped = store
            .blocking_move("q", "q:claimed", Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(popped, None);
    }

    #[tokio::test]
    async fn test_push_wakes_blocked_move() {
        let store = Arc::new(MemoryBackend::new());

        let waiter = tokio::spawn({
            let store = store.clone();
            async move {
                store
                    .blocking_move("q", "q:claimed", Duration::from_secs(5))
                    .await
                    .unwrap()
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        store.push("q", "a", ListEnd::Back).await.unwrap();

        assert_eq!(waiter.await.unwrap(), Some("a".to_string()));
        assert_eq!(store.list_range("q:claimed", 0, -1).await.unwrap(), vec!["a"]);
        assert_eq!(store.list_len("q").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_front_push_runs_first() {
        let store = MemoryBackend::new();
        store.push("q", "normal", ListEnd::Back).await.unwrap();
        store.push("q", "urgent", ListEnd::Front).await.unwrap();

        let first = store
            .blocking_move("q", "q:claimed", Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(first.as_deref(), Some("urgent"));
    }

    #[tokio::test]
    async fn test_list_range_negative_indexes() {
        let store = MemoryBackend::new();
        for value in ["a", "b", "c", "d"] {
            store.push("l", value, ListEnd::Back).await.unwrap();
        }
        assert_eq!(store.list_range("l", 0, -1).await.unwrap().len(), 4);
        assert_eq!(store.list_range("l", -2, -1).await.unwrap(), vec!["c", "d"]);
        assert_eq!(store.list_range("l", 1, 100).await.unwrap(), vec!["b", "c", "d"]);
        assert!(store.list_range("l", 3, 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_compare_and_set_requires_current_value() {
        let store = MemoryBackend::new();
        assert!(!store
            .hash_compare_and_set("q:processing", "t1", "old", "new")
            .await
            .unwrap());

        store
            .index_claimed("q:claimed", "raw", "q:processing", "t1", "old")
            .await
            .unwrap();
        assert!(!store
            .hash_compare_and_set("q:processing", "t1", "stale", "new")
            .await
            .unwrap());
        assert!(store
            .hash_compare_and_set("q:processing", "t1", "old", "new")
            .await
            .unwrap());
        assert_eq!(
            store.hash_get("q:processing", "t1").await.unwrap().as_deref(),
            Some("new")
        );
    }

    #[tokio::test]
    async fn test_retire_succeeds_once() {
        let store = MemoryBackend::new();
        store
            .index_claimed("q:claimed", "raw", "q:processing", "t1", "record")
            .await
            .unwrap();

        let first = store
            .retire(
                "q:processing",
                "t1",
                Transfer::Push {
                    list: "q:dead_letter",
                    value: "entry",
                    end: ListEnd::Back,
                },
            )
            .await
            .unwrap();
        let second = store
            .retire(
                "q:processing",
                "t1",
                Transfer::Push {
                    list: "q:dead_letter",
                    value: "entry",
                    end: ListEnd::Back,
                },
            )
            .await
            .unwrap();

        assert!(first);
        assert!(!second);
        assert_eq!(store.list_len("q:dead_letter").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_hash_ttl_follows_clock() {
        let clock = Arc::new(ManualClock::default());
        let store = MemoryBackend::with_clock(clock.clone());

        store
            .hash_merge(
                "q:status:j1",
                &[("status".to_string(), "queued".to_string())],
                &[],
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        assert_eq!(store.scan_prefix("q:status:").await.unwrap().len(), 1);

        clock.advance(Duration::from_secs(61));
        assert!(store.hash_get_all("q:status:j1").await.unwrap().is_empty());
        assert!(store.scan_prefix("q:status:").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_promote_due_respects_time_and_priority() {
        let store = MemoryBackend::new();
        store.push("q", "waiting", ListEnd::Back).await.unwrap();
        {
            let mut state = store.lock();
            state.zadd("q:delayed", 100, r#"{"priority":1,"n":"late"}"#.to_string());
            state.zadd("q:delayed", 10, r#"{"priority":2,"n":"urgent"}"#.to_string());
            state.zadd("q:delayed", 500, r#"{"priority":1,"n":"future"}"#.to_string());
        }

        let moved = store.promote_due("q:delayed", "q", 200, 10).await.unwrap();
        assert_eq!(moved, 2);
        assert_eq!(store.delayed_len("q:delayed").await.unwrap(), 1);

        let pending = store.list_range("q", 0, -1).await.unwrap();
        assert_eq!(pending[0], r#"{"priority":2,"n":"urgent"}"#);
        assert_eq!(pending[1], "waiting");
        assert_eq!(pending[2], r#"{"priority":1,"n":"late"}"#);
    }

    #[tokio::test]
    async fn test_hash_incr_rejects_non_integer() {
        let store = MemoryBackend::new();
        assert_eq!(store.hash_incr("s", "n", 2).await.unwrap(), 2);
        assert_eq!(store.hash_incr("s", "n", 3).await.unwrap(), 5);

        store
            .hash_merge(
                "s",
                &[("text".to_string(), "abc".to_string())],
                &[],
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        assert!(store.hash_incr("s", "text", 1).await.is_err());
    }

    #[tokio::test]
    async fn test_unavailable_and_read_only_modes() {
        let store = MemoryBackend::new();

        store.set_read_only(true);
        assert!(store.ping().await.is_ok());
        assert!(matches!(
            store.probe_write("q:probe").await,
            Err(StoreError::ReadOnly(_))
        ));

        store.set_read_only(false);
        store.set_unavailable(true);
        let err = store.ping().await.unwrap_err();
        assert!(err.is_transient());
        assert!(matches!(err, StoreError::Connection(_)));
    }
}
