//! Work queue for reconciliation requests.
//!
//! Keys are deduplicated while pending, and a key that is being processed
//! is never handed to a second worker: an `enqueue` during processing is
//! parked until `done` is called. Failed keys are retried through delayed
//! adds with per-key exponential backoff.
//!
//! Time comes from `tokio::time`, so tests can run against the paused
//! clock.

use crate::backoff::ExponentialBackoff;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Stand-in deadline for delays too large to add to the clock.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Deduplicating, rate-limited work queue.
#[derive(Debug)]
pub struct WorkQueue<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
    backoff: ExponentialBackoff,
}

#[derive(Debug)]
struct QueueState<K> {
    /// Keys ready to be handed out, in order
    queue: VecDeque<K>,
    /// Keys that need a pass (queued, or parked behind processing)
    dirty: HashSet<K>,
    /// Keys currently held by a worker
    processing: HashSet<K>,
    /// Delayed keys and when they become ready
    waiting: HashMap<K, Instant>,
    /// Consecutive failures per key
    failures: HashMap<K, u32>,
    shutting_down: bool,
}

impl<K> QueueState<K>
where
    K: Clone + Eq + Hash,
{
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            dirty: HashSet::new(),
            processing: HashSet::new(),
            waiting: HashMap::new(),
            failures: HashMap::new(),
            shutting_down: false,
        }
    }

    /// A key that failed and has a pending retry keeps its retry time.
    fn backing_off(&self, key: &K) -> bool {
        self.waiting.contains_key(key) && self.failures.get(key).copied().unwrap_or(0) > 0
    }

    /// Returns true when the key became available to a worker.
    fn add(&mut self, key: K) -> bool {
        if self.shutting_down || self.backing_off(&key) {
            return false;
        }
        if !self.dirty.insert(key.clone()) {
            return false;
        }
        self.waiting.remove(&key);
        if self.processing.contains(&key) {
            return false;
        }
        self.queue.push_back(key);
        true
    }

    fn schedule(&mut self, key: K, ready_at: Instant) {
        if self.shutting_down {
            return;
        }
        self.waiting
            .entry(key)
            .and_modify(|at| *at = (*at).min(ready_at))
            .or_insert(ready_at);
    }

    /// Move delayed keys whose time has come into the queue.
    fn promote_ready(&mut self, now: Instant) -> bool {
        let ready: Vec<K> = self
            .waiting
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(key, _)| key.clone())
            .collect();

        let mut added = false;
        for key in ready {
            self.waiting.remove(&key);
            added |= self.add(key);
        }
        added
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.waiting.values().min().copied()
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash,
{
    /// Create an empty queue using `backoff` for failed keys.
    pub fn new(backoff: ExponentialBackoff) -> Self {
        Self {
            state: Mutex::new(QueueState::new()),
            notify: Notify::new(),
            backoff,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<K>> {
        // State stays consistent across a panicking holder: every mutation
        // is a single collection operation.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Request a pass for `key`. Duplicate pending requests collapse into one.
    pub fn enqueue(&self, key: K) {
        let added = self.lock().add(key);
        if added {
            self.notify.notify_one();
        }
    }

    /// Wait for the next key and mark it as processing.
    ///
    /// Returns `None` once the queue is shut down.
    pub async fn dequeue(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let deadline = {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }
                state.promote_ready(Instant::now());
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                state.next_deadline()
            };

            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        () = &mut notified => {}
                        () = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Release `key` after a pass. A request that arrived meanwhile is
    /// queued now, unless the key is waiting out a backoff.
    pub fn done(&self, key: &K) {
        let requeued = {
            let mut state = self.lock();
            state.processing.remove(key);
            if !state.dirty.contains(key) {
                false
            } else if state.backing_off(key) || state.shutting_down {
                state.dirty.remove(key);
                false
            } else {
                state.queue.push_back(key.clone());
                true
            }
        };
        if requeued {
            self.notify.notify_one();
        }
    }

    /// Run `key` again after `delay`. An earlier pending deadline wins.
    pub fn requeue_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.enqueue(key);
            return;
        }
        let now = Instant::now();
        let ready_at = now.checked_add(delay).unwrap_or_else(|| now + FAR_FUTURE);
        self.lock().schedule(key, ready_at);
        // A waiting worker may need to shorten its sleep
        self.notify.notify_one();
    }

    /// Record a failure for `key` and retry it after the backoff delay.
    pub fn requeue_with_backoff(&self, key: K) -> Duration {
        let delay = {
            let mut state = self.lock();
            let failures = state.failures.entry(key.clone()).or_insert(0);
            *failures = failures.saturating_add(1);
            self.backoff.delay_for(*failures)
        };
        self.requeue_after(key, delay);
        delay
    }

    /// Record a failure for `key` and retry it after the maximum delay.
    pub fn requeue_with_max_backoff(&self, key: K) -> Duration {
        {
            let mut state = self.lock();
            let failures = state.failures.entry(key.clone()).or_insert(0);
            *failures = failures.saturating_add(1);
        }
        let delay = self.backoff.max();
        self.requeue_after(key, delay);
        delay
    }

    /// Clear the failure history of `key`.
    pub fn forget(&self, key: &K) {
        self.lock().failures.remove(key);
    }

    /// Consecutive failures recorded for `key`.
    pub fn failures(&self, key: &K) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Whether a worker currently holds `key`.
    pub fn is_processing(&self, key: &K) -> bool {
        self.lock().processing.contains(key)
    }

    /// Keys ready to be handed out.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Whether no key is ready.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys scheduled for later.
    pub fn delayed_len(&self) -> usize {
        self.lock().waiting.len()
    }

    /// Stop handing out keys and wake every waiting worker.
    pub fn shutdown(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    /// Whether `shutdown` was called.
    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn queue() -> WorkQueue<&'static str> {
        WorkQueue::new(ExponentialBackoff::default())
    }

    #[tokio::test]
    async fn test_enqueue_deduplicates_pending_keys() {
        let queue = queue();
        queue.enqueue("a");
        queue.enqueue("a");
        queue.enqueue("b");
        assert_eq!(queue.len(), 2, "duplicate pending entries should collapse");

        assert_eq!(queue.dequeue().await, Some("a"));
        assert_eq!(queue.dequeue().await, Some("b"));
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_while_processing_is_deferred() {
        let queue = queue();
        queue.enqueue("a");
        assert_eq!(queue.dequeue().await, Some("a"));
        assert!(queue.is_processing(&"a"));

        queue.enqueue("a");
        assert_eq!(queue.len(), 0, "a key in flight must not be handed out twice");
        let second = tokio::time::timeout(Duration::from_secs(1), queue.dequeue()).await;
        assert!(second.is_err(), "no second worker may receive the key");

        queue.done(&"a");
        assert_eq!(queue.len(), 1, "deferred request is released by done");
        assert_eq!(queue.dequeue().await, Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_done_without_new_request_does_not_requeue() {
        let queue = queue();
        queue.enqueue("a");
        let key = queue.dequeue().await.unwrap();
        queue.done(&key);
        assert!(queue.is_empty());
        assert!(!queue.is_processing(&"a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeue_after_delays_key() {
        let queue = queue();
        let start = Instant::now();
        queue.requeue_after("a", Duration::from_secs(5));
        assert_eq!(queue.delayed_len(), 1);

        let early = tokio::time::timeout(Duration::from_secs(4), queue.dequeue()).await;
        assert!(early.is_err(), "key must not be ready before its delay");

        assert_eq!(queue.dequeue().await, Some("a"));
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_grows_and_forget_resets() {
        let queue = queue();
        assert_eq!(queue.requeue_with_backoff("a"), Duration::from_secs(1));
        assert_eq!(queue.requeue_with_backoff("a"), Duration::from_secs(2));
        assert_eq!(queue.requeue_with_backoff("a"), Duration::from_secs(4));
        assert_eq!(queue.failures(&"a"), 3);

        queue.forget(&"a");
        assert_eq!(queue.failures(&"a"), 0);
        assert_eq!(queue.requeue_with_backoff("a"), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_backoff() {
        let queue = queue();
        assert_eq!(queue.requeue_with_max_backoff("a"), Duration::from_secs(300));
        assert_eq!(queue.failures(&"a"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_during_backoff_wait_for_retry() {
        let queue = queue();
        queue.enqueue("a");
        let key = queue.dequeue().await.unwrap();

        // Failure recorded while processing, then an event arrives
        queue.requeue_with_backoff(key);
        queue.enqueue("a");
        queue.done(&"a");
        assert!(queue.is_empty(), "backoff must not be bypassed by events");

        let start = Instant::now();
        assert_eq!(queue.dequeue().await, Some("a"));
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_cancels_plain_delay() {
        let queue = queue();
        queue.requeue_after("a", Duration::from_secs(300));
        queue.enqueue("a");
        assert_eq!(queue.delayed_len(), 0);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_wakes_waiting_workers() {
        let queue = Arc::new(queue());
        let worker = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::task::yield_now().await;

        queue.shutdown();
        assert_eq!(worker.await.unwrap(), None);

        queue.enqueue("a");
        assert!(queue.is_empty(), "no new work after shutdown");
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_delay_parks_key_without_overflow() {
        let queue = queue();

        queue.requeue_after("a", Duration::from_secs(u64::MAX));
        assert_eq!(queue.delayed_len(), 1);
        assert!(queue.is_empty());

        tokio::time::advance(Duration::from_secs(86_400 * 365)).await;
        let next = tokio::time::timeout(Duration::from_secs(1), queue.dequeue()).await;
        assert!(next.is_err(), "key must stay parked");
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_wakes_waiting_worker() {
        let queue = Arc::new(queue());
        let worker = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::task::yield_now().await;

        queue.enqueue("a");
        assert_eq!(worker.await.unwrap(), Some("a"));
    }
}
