//! Rate-limited, de-duplicating work queue
//!
//! An item is queued at most once. An item added again while a worker is
//! processing it is parked and re-queued when the worker calls [`WorkQueue::done`],
//! so the same item is never handed to two workers at once. Delayed adds are
//! owned by the queue and cancelled on shutdown.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct QueueState<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    failures: HashMap<K, u32>,
    /// Pending delayed adds and when they fire
    waiting: HashMap<K, Instant>,
    shutting_down: bool,
}

impl<K> Default for QueueState<K> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            dirty: HashSet::new(),
            processing: HashSet::new(),
            failures: HashMap::new(),
            waiting: HashMap::new(),
            shutting_down: false,
        }
    }
}

#[derive(Debug)]
struct Inner<K> {
    name: String,
    state: Mutex<QueueState<K>>,
    notify: Notify,
    timers: CancellationToken,
    base_delay: Duration,
    max_delay: Duration,
}

/// Shared handle to a work queue
#[derive(Debug)]
pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Exponential backoff for the `failures`-th consecutive failure
pub fn backoff(failures: u32, base: Duration, max: Duration) -> Duration {
    let exp = failures.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exp)
        .map_or(max, |delay| delay.min(max))
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
    pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

    pub fn new(name: impl Into<String>) -> Self {
        Self::with_backoff(name, Self::DEFAULT_BASE_DELAY, Self::DEFAULT_MAX_DELAY)
    }

    pub fn with_backoff(name: impl Into<String>, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
                timers: CancellationToken::new(),
                base_delay,
                max_delay,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn add(&self, item: K) {
        let mut state = self.inner.state.lock();
        if state.shutting_down || state.dirty.contains(&item) {
            return;
        }
        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Add `item` once `delay` has elapsed.
    ///
    /// Only the earliest pending deadline per item is kept.
    pub fn add_after(&self, item: K, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let deadline = Instant::now() + delay;
        {
            let mut state = self.inner.state.lock();
            if state.shutting_down || state.waiting.get(&item).is_some_and(|at| *at <= deadline) {
                return;
            }
            state.waiting.insert(item.clone(), deadline);
        }

        let queue = self.clone();
        let cancel = self.inner.timers.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => queue.fire(item, deadline),
            }
        });
    }

    fn fire(&self, item: K, deadline: Instant) {
        {
            let mut state = self.inner.state.lock();
            // Superseded by an earlier deadline that already fired.
            if state.waiting.get(&item) != Some(&deadline) {
                return;
            }
            state.waiting.remove(&item);
        }
        self.add(item);
    }

    /// Number of delayed adds not yet fired
    pub fn delayed_len(&self) -> usize {
        self.inner.state.lock().waiting.len()
    }

    /// Add `item` after its per-item backoff and count the failure
    pub fn add_rate_limited(&self, item: K) {
        let failures = {
            let mut state = self.inner.state.lock();
            let count = state.failures.entry(item.clone()).or_insert(0);
            *count += 1;
            *count
        };
        let delay = backoff(failures, self.inner.base_delay, self.inner.max_delay);
        self.add_after(item, delay);
    }

    /// Reset the failure count of `item`
    pub fn forget(&self, item: &K) {
        self.inner.state.lock().failures.remove(item);
    }

    pub fn num_requeues(&self, item: &K) -> u32 {
        self.inner
            .state
            .lock()
            .failures
            .get(item)
            .copied()
            .unwrap_or(0)
    }

    /// Wait for the next item; `None` once the queue is shut down
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock();
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        self.inner.notify.notify_one();
                    }
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Mark `item` finished; re-queues it if it was added meanwhile
    pub fn done(&self, item: &K) {
        let mut state = self.inner.state.lock();
        state.processing.remove(item);
        if state.dirty.contains(item) {
            state.queue.push_back(item.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop handing out items, drop delayed adds and wake every waiting worker
    pub fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            state.shutting_down = true;
            state.waiting.clear();
        }
        self.inner.timers.cancel();
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_deduplicates() {
        let queue = WorkQueue::new("test");
        queue.add("a");
        queue.add("a");
        queue.add("b");
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.get().await, Some("a"));
        assert_eq!(queue.get().await, Some("b"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_readd_while_processing_is_deferred() {
        let queue = WorkQueue::new("test");
        queue.add("a");
        let item = queue.get().await.unwrap();

        queue.add("a");
        queue.add("a");
        assert!(queue.is_empty());

        queue.done(&item);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, Some("a"));
        queue.done(&"a");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_wakes_workers() {
        let queue: WorkQueue<&'static str> = WorkQueue::new("test");
        let worker = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;
        queue.shutdown();
        assert_eq!(worker.await.unwrap(), None);

        queue.add("late");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_waiting_worker_receives_item() {
        let queue: WorkQueue<u32> = WorkQueue::new("test");
        let worker = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;
        queue.add(7);
        assert_eq!(worker.await.unwrap(), Some(7));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let base = Duration::from_millis(5);
        let max = Duration::from_secs(1000);
        assert_eq!(backoff(1, base, max), Duration::from_millis(5));
        assert_eq!(backoff(2, base, max), Duration::from_millis(10));
        assert_eq!(backoff(3, base, max), Duration::from_millis(20));
        assert_eq!(backoff(30, base, max), max);
        assert_eq!(backoff(u32::MAX, base, max), max);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_requeue() {
        let queue = WorkQueue::new("test");
        queue.add_rate_limited("a");
        queue.add_rate_limited("a");
        assert_eq!(queue.num_requeues(&"a"), 2);
        assert!(queue.is_empty());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.get().await, Some("a"));

        queue.forget(&"a");
        assert_eq!(queue.num_requeues(&"a"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_after() {
        let queue = WorkQueue::new("test");
        queue.add_after("a", Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(queue.is_empty());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.delayed_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_after_keeps_earliest_deadline() {
        let queue = WorkQueue::new("test");
        queue.add_after("a", Duration::from_secs(60));
        queue.add_after("a", Duration::from_secs(5));
        queue.add_after("a", Duration::from_secs(30));
        assert_eq!(queue.delayed_len(), 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(queue.get().await, Some("a"));
        queue.done(&"a");

        // The superseded 60s timer does not add it again.
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_delayed_adds() {
        let queue = WorkQueue::new("test");
        queue.add_after("ttl", Duration::from_secs(3600));
        queue.add_rate_limited("retry");
        assert_eq!(queue.delayed_len(), 2);

        queue.shutdown();
        assert_eq!(queue.delayed_len(), 0);
        assert!(queue.inner.timers.is_cancelled());

        tokio::time::sleep(Duration::from_secs(7200)).await;
        assert!(queue.is_empty());
        queue.add_after("late", Duration::from_secs(1));
        assert_eq!(queue.delayed_len(), 0);
    }
}
