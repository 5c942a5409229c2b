//! Per-key admission control
//!
//! A [`KeyedLimiter`] bounds how many operations sharing the same key (e.g.
//! fetches of the same upstream planning) run concurrently, without putting
//! any bound across *different* keys. A slow key therefore cannot starve
//! work on unrelated keys.
//!
//! This is local-process, advisory concurrency control: the consistency
//! guarantees of the system live in the persistent store, not here.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

struct KeyEntry {
    active: usize,
    waiters: VecDeque<oneshot::Sender<()>>,
}

struct Inner {
    limit: usize,
    table: Mutex<HashMap<String, KeyEntry>>,
}

/// Bounds concurrent operations per distinct key.
///
/// Cloning yields another handle to the same limiter. Keys not currently in
/// use occupy no memory: an entry is dropped once nothing is active and
/// nobody waits on it.
#[derive(Clone)]
pub struct KeyedLimiter {
    inner: Arc<Inner>,
}

impl KeyedLimiter {
    /// `limit` is the maximum number of concurrently held permits per key.
    pub fn new(limit: usize) -> Self {
        assert!(limit > 0, "a limiter with no permits would deadlock");
        Self {
            inner: Arc::new(Inner {
                limit,
                table: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Waits until a permit for `key` is free, then takes it.
    ///
    /// Waiters of the same key are woken in FIFO order. The permit is
    /// released when the returned guard is dropped.
    pub async fn acquire(&self, key: &str) -> KeyPermit {
        let waiter = {
            let mut table = self.inner.table.lock().unwrap();
            let entry = table.entry(key.to_string()).or_insert_with(|| KeyEntry {
                active: 0,
                waiters: VecDeque::new(),
            });
            if entry.active < self.inner.limit {
                entry.active += 1;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                entry.waiters.push_back(tx);
                Some(rx)
            }
        };

        if let Some(rx) = waiter {
            // The releaser hands its slot over instead of decrementing, so a
            // successful recv means the active count already includes us. The
            // guard covers the window where the hand-off already landed but
            // this future gets dropped before being polled again.
            let mut guard = HandoffGuard {
                inner: Arc::clone(&self.inner),
                key: key.to_string(),
                rx: Some(rx),
            };
            if let Some(rx) = guard.rx.as_mut() {
                let _ = rx.await;
            }
            guard.rx = None;
        }

        KeyPermit {
            inner: Arc::clone(&self.inner),
            key: key.to_string(),
        }
    }

    /// Number of keys currently tracked (active or waited on).
    pub fn tracked_keys(&self) -> usize {
        self.inner.table.lock().unwrap().len()
    }

    /// Number of permits currently held for `key`.
    pub fn active(&self, key: &str) -> usize {
        self.inner
            .table
            .lock()
            .unwrap()
            .get(key)
            .map(|entry| entry.active)
            .unwrap_or(0)
    }
}

/// Watches a parked waiter. If its `acquire` future is dropped, a slot that
/// was already handed to it is put back instead of leaking.
struct HandoffGuard {
    inner: Arc<Inner>,
    key: String,
    rx: Option<oneshot::Receiver<()>>,
}

impl Drop for HandoffGuard {
    fn drop(&mut self) {
        let mut rx = match self.rx.take() {
            Some(rx) => rx,
            None => return,
        };
        let mut table = self.inner.table.lock().unwrap();
        // Serialized with releasers by the table lock: either the hand-off
        // already landed (reclaim it here), or the closing of the channel is
        // observed by the sender, which then skips this waiter.
        if rx.try_recv().is_ok() {
            release_slot(&mut table, &self.key);
        }
    }
}

/// A held permit; dropping it wakes the oldest waiter of the same key.
pub struct KeyPermit {
    inner: Arc<Inner>,
    key: String,
}

impl Drop for KeyPermit {
    fn drop(&mut self) {
        let mut table = self.inner.table.lock().unwrap();
        release_slot(&mut table, &self.key);
    }
}

fn release_slot(table: &mut HashMap<String, KeyEntry>, key: &str) {
    let entry = match table.get_mut(key) {
        Some(entry) => entry,
        None => return,
    };

    // Hand the slot to the oldest waiter still listening. A waiter whose
    // acquire() future was dropped has a closed channel and is skipped.
    while let Some(tx) = entry.waiters.pop_front() {
        if tx.send(()).is_ok() {
            return;
        }
    }

    entry.active -= 1;
    if entry.active == 0 && entry.waiters.is_empty() {
        table.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn never_exceeds_the_per_key_limit() {
        let limiter = KeyedLimiter::new(2);
        let current = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let limiter = limiter.clone();
            let current = Arc::clone(&current);
            let max_seen = Arc::clone(&max_seen);
            handles.push(tokio::spawn(async move {
                let _permit = limiter.acquire("key").await;
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                current.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn distinct_keys_do_not_block_each_other() {
        let limiter = KeyedLimiter::new(1);

        let _held = limiter.acquire("slow-key").await;

        // Must resolve immediately even though "slow-key" is saturated
        let other = tokio::time::timeout(Duration::from_secs(1), limiter.acquire("other-key"))
            .await
            .expect("unrelated key should not wait");
        drop(other);
    }

    #[tokio::test]
    async fn table_prunes_idle_keys() {
        let limiter = KeyedLimiter::new(1);

        let a = limiter.acquire("a").await;
        let b = limiter.acquire("b").await;
        assert_eq!(limiter.tracked_keys(), 2);

        drop(a);
        assert_eq!(limiter.tracked_keys(), 1);
        drop(b);
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[tokio::test]
    async fn waiters_are_woken_in_fifo_order() {
        let limiter = KeyedLimiter::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = limiter.acquire("key").await;

        let mut handles = Vec::new();
        for i in 0..3 {
            let limiter = limiter.clone();
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let _permit = limiter.acquire("key").await;
                order.lock().unwrap().push(i);
            }));
            // Make sure waiters queue up one by one
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        drop(first);
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn cancelled_waiter_does_not_leak_its_slot() {
        let limiter = KeyedLimiter::new(1);

        let held = limiter.acquire("key").await;

        let waiting = {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                let _permit = limiter.acquire("key").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        waiting.abort();
        let _ = waiting.await;

        drop(held);

        // The aborted waiter must not have swallowed the permit
        let reacquired =
            tokio::time::timeout(Duration::from_secs(1), limiter.acquire("key")).await;
        assert!(reacquired.is_ok());
        assert_eq!(limiter.active("key"), 1);
    }

    #[tokio::test]
    async fn waiter_dropped_after_the_handoff_returns_the_slot() {
        let limiter = KeyedLimiter::new(1);

        let held = limiter.acquire("key").await;

        let waiting = {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                let _permit = limiter.acquire("key").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Release first, so the hand-off lands in the waiter's channel, then
        // drop the waiter before it is ever polled again
        drop(held);
        waiting.abort();
        let _ = waiting.await;

        let reacquired =
            tokio::time::timeout(Duration::from_secs(1), limiter.acquire("key")).await;
        assert!(reacquired.is_ok(), "the handed-over slot was lost");
        assert_eq!(limiter.active("key"), 1);
    }
}
