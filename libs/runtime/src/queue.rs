//! Per-key work queue and backoff (`spec.md §4.4`).
//!
//! Grounded on `kube-runtime`'s `scheduler.rs` (dedup: of two scheduled
//! times for the same key, the earlier one wins) and its `Runner` (a key
//! already being processed is held back rather than handed to a second
//! worker). Both are reshaped here into a single `WorkQueue` with an
//! explicit `pop`/`done` pair, since the engine drives its own worker pool
//! loop rather than composing `Stream` adaptors.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::hash::Hash;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

struct HeapItem<K> {
    at: Instant,
    key: K,
}

impl<K> PartialEq for HeapItem<K> {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at
    }
}
impl<K> Eq for HeapItem<K> {}

impl<K> PartialOrd for HeapItem<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for HeapItem<K> {
    // Reversed so `BinaryHeap`, a max-heap, pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.at.cmp(&self.at)
    }
}

struct Inner<K> {
    heap: BinaryHeap<HeapItem<K>>,
    /// Authoritative next-due instant per key. A heap entry whose `at`
    /// doesn't match this map's value for its key is stale and is dropped
    /// when popped.
    scheduled: HashMap<K, Instant>,
    /// Keys a worker currently holds via `pop`, not yet released by `done`.
    active: HashSet<K>,
    /// Re-enqueue requests that arrived for an active key; applied on `done`.
    deferred: HashMap<K, Instant>,
}

/// A deduplicated, delayed, per-key-serializing queue keyed by namespaced name.
pub struct WorkQueue<K> {
    inner: Mutex<Inner<K>>,
    notify: Notify,
}

impl<K: Eq + Hash + Clone> Default for WorkQueue<K> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                scheduled: HashMap::new(),
                active: HashSet::new(),
                deferred: HashMap::new(),
            }),
            notify: Notify::new(),
        }
    }
}

impl<K: Eq + Hash + Clone> WorkQueue<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn enqueue_now(&self, key: K) {
        self.enqueue_after(key, Duration::ZERO).await;
    }

    /// Schedule `key` to become available after `delay`. If `key` is
    /// already scheduled, the earlier of the two times wins. If `key` is
    /// currently being processed, the request is held until `done` is called.
    pub async fn enqueue_after(&self, key: K, delay: Duration) {
        let at = Instant::now() + delay;
        let mut inner = self.inner.lock().await;

        if inner.active.contains(&key) {
            inner
                .deferred
                .entry(key)
                .and_modify(|existing| {
                    if at < *existing {
                        *existing = at;
                    }
                })
                .or_insert(at);
            return;
        }

        match inner.scheduled.get(&key) {
            Some(existing) if *existing <= at => return,
            _ => {
                inner.scheduled.insert(key.clone(), at);
                inner.heap.push(HeapItem { at, key });
            }
        }
        drop(inner);
        self.notify.notify_one();
    }

    /// Wait for the next due key and mark it active. The caller must call
    /// `done` once it has finished processing, or the key will never be
    /// handed out again even if re-enqueued.
    pub async fn pop(&self) -> K {
        loop {
            let wait_until;
            {
                let mut inner = self.inner.lock().await;
                match inner.heap.peek() {
                    Some(top) if top.at <= Instant::now() => {
                        let item = inner.heap.pop().expect("just peeked");
                        if inner.scheduled.get(&item.key) != Some(&item.at) {
                            continue; // stale entry, superseded by a later enqueue
                        }
                        inner.scheduled.remove(&item.key);
                        inner.active.insert(item.key.clone());
                        return item.key;
                    }
                    Some(top) => wait_until = Some(top.at),
                    None => wait_until = None,
                }
            }
            match wait_until {
                Some(at) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(at) => {}
                        _ = self.notify.notified() => {}
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }

    /// Release `key`, applying any re-enqueue request that arrived while it
    /// was active.
    pub async fn done(&self, key: &K) {
        let mut inner = self.inner.lock().await;
        inner.active.remove(key);
        let Some(at) = inner.deferred.remove(key) else {
            return;
        };
        match inner.scheduled.get(key) {
            Some(existing) if *existing <= at => {}
            _ => {
                inner.scheduled.insert(key.clone(), at);
                inner.heap.push(HeapItem { at, key: key.clone() });
            }
        }
        drop(inner);
        self.notify.notify_one();
    }
}

/// Exponential backoff per key, per `spec.md §4.4`: starts at 5ms, doubles,
/// caps at 1000s. `forget` resets the counter on a successful reconcile.
pub struct Backoff<K> {
    base: Duration,
    cap: Duration,
    attempts: Mutex<HashMap<K, u32>>,
}

impl<K: Eq + Hash + Clone> Default for Backoff<K> {
    fn default() -> Self {
        Self::new(Duration::from_millis(5), Duration::from_secs(1000))
    }
}

impl<K: Eq + Hash + Clone> Backoff<K> {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    pub async fn next(&self, key: &K) -> Duration {
        let mut attempts = self.attempts.lock().await;
        let count = attempts.entry(key.clone()).or_insert(0);
        // Cap the exponent well before `2^n` could overflow; the resulting
        // delay is already pinned at `cap` long before this point.
        let exponent = (*count).min(30);
        let delay = self
            .base
            .saturating_mul(1u32.checked_shl(exponent).unwrap_or(u32::MAX))
            .min(self.cap);
        *count = count.saturating_add(1);
        delay
    }

    pub async fn forget(&self, key: &K) {
        self.attempts.lock().await.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pop_waits_for_delay() {
        let queue: WorkQueue<&str> = WorkQueue::new();
        queue.enqueue_after("a", Duration::from_millis(20)).await;
        let start = Instant::now();
        let key = queue.pop().await;
        assert_eq!(key, "a");
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[tokio::test]
    async fn dedup_keeps_earlier_enqueue() {
        let queue: WorkQueue<&str> = WorkQueue::new();
        queue.enqueue_after("a", Duration::from_secs(10)).await;
        queue.enqueue_after("a", Duration::from_millis(5)).await;
        let start = Instant::now();
        let key = queue.pop().await;
        assert_eq!(key, "a");
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn dedup_ignores_later_enqueue() {
        let queue: WorkQueue<&str> = WorkQueue::new();
        queue.enqueue_after("a", Duration::from_millis(5)).await;
        queue.enqueue_after("a", Duration::from_secs(10)).await;
        let start = Instant::now();
        let key = queue.pop().await;
        assert_eq!(key, "a");
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn active_key_defers_reenqueue_until_done() {
        let queue: WorkQueue<&str> = WorkQueue::new();
        queue.enqueue_now("a").await;
        let key = queue.pop().await;
        assert_eq!(key, "a");

        // Re-enqueue while "a" is active: held back, not handed out again.
        queue.enqueue_now("a").await;
        assert!(tokio::time::timeout(Duration::from_millis(30), queue.pop())
            .await
            .is_err());

        queue.done(&key).await;
        let key = queue.pop().await;
        assert_eq!(key, "a");
    }

    #[tokio::test]
    async fn backoff_doubles_and_caps() {
        let backoff: Backoff<&str> = Backoff::new(Duration::from_millis(5), Duration::from_millis(40));
        assert_eq!(backoff.next(&"a").await, Duration::from_millis(5));
        assert_eq!(backoff.next(&"a").await, Duration::from_millis(10));
        assert_eq!(backoff.next(&"a").await, Duration::from_millis(20));
        assert_eq!(backoff.next(&"a").await, Duration::from_millis(40));
        assert_eq!(backoff.next(&"a").await, Duration::from_millis(40));
    }

    #[tokio::test]
    async fn forget_resets_backoff() {
        let backoff: Backoff<&str> = Backoff::new(Duration::from_millis(5), Duration::from_millis(40));
        let _ = backoff.next(&"a").await;
        let _ = backoff.next(&"a").await;
        backoff.forget(&"a").await;
        assert_eq!(backoff.next(&"a").await, Duration::from_millis(5));
    }
}
