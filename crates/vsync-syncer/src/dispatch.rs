//! Work queue and bounded workers
//!
//! The queue coalesces repeated triggers of one identity into a single
//! pending item and never hands an item to two workers at once: an item
//! re-added while it is processed is parked and queued again when the
//! worker calls [`WorkQueue::done`].
//!
//! Workers run under a semaphore, isolate panics per item and requeue
//! failures with exponential backoff capped by the configured ceiling.

use std::collections::{HashSet, VecDeque};
use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use rand::Rng;
use tokio::sync::{Notify, OwnedMutexGuard, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use vsync_common::{Result, SyncConfig};

use crate::types::Action;

// =============================================================================
// Work queue
// =============================================================================

struct QueueState<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    shutting_down: bool,
}

/// Deduplicating FIFO with delayed adds
pub struct WorkQueue<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
}

impl<T: Clone + Eq + Hash + Send + 'static> Default for WorkQueue<T> {
    fn default() -> Self {
        Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
        }
    }
}

impl<T: Clone + Eq + Hash + Send + 'static> WorkQueue<T> {
    /// Empty queue
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState<T>> {
        // Queue state stays consistent across a panicking holder
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue an item unless it is already pending
    pub fn add(&self, item: T) {
        let mut state = self.lock();
        if state.shutting_down || state.dirty.contains(&item) {
            return;
        }
        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.notify.notify_one();
    }

    /// Queue an item after `delay`
    pub fn add_after(self: &Arc<Self>, item: T, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    /// Next item; `None` once the queue is shut down
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.lock();
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark an item finished; queues it again if it was re-added meanwhile
    pub fn done(&self, item: &T) {
        let mut state = self.lock();
        state.processing.remove(item);
        if state.dirty.contains(item) && !state.shutting_down {
            state.queue.push_back(item.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Stop handing out items and wake every waiter
    pub fn shutdown(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    /// Number of items waiting
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// True if no item waits
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// Per-identity lock
// =============================================================================

/// Mutual exclusion per key; entries disappear with their last holder
pub struct KeyedLock<T: Eq + Hash> {
    locks: Arc<DashMap<T, Arc<tokio::sync::Mutex<()>>>>,
}

impl<T: Eq + Hash + Clone> Default for KeyedLock<T> {
    fn default() -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
        }
    }
}

/// Held lock of one key
pub struct KeyedGuard<T: Eq + Hash> {
    key: T,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<DashMap<T, Arc<tokio::sync::Mutex<()>>>>,
}

impl<T: Eq + Hash + Clone> KeyedLock<T> {
    /// Lock table without entries
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until `key` is free and take it
    pub async fn lock(&self, key: T) -> KeyedGuard<T> {
        let mutex = self.locks.entry(key.clone()).or_default().clone();
        let guard = mutex.lock_owned().await;
        KeyedGuard {
            key,
            guard: Some(guard),
            locks: self.locks.clone(),
        }
    }

    /// Number of keys currently held or awaited
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// True if no key is held
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl<T: Eq + Hash> Drop for KeyedGuard<T> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

// =============================================================================
// Error backoff
// =============================================================================

/// Exponential per-item backoff with jitter, capped by a ceiling
pub struct ErrorBackoff<T: Eq + Hash> {
    base: Duration,
    ceiling: Duration,
    failures: DashMap<T, u32>,
}

impl<T: Eq + Hash> ErrorBackoff<T> {
    /// Backoff starting at `base`, never exceeding `ceiling`
    pub fn new(base: Duration, ceiling: Duration) -> Self {
        Self {
            base,
            ceiling,
            failures: DashMap::new(),
        }
    }

    /// Delay before the next attempt of `item`; counts a failure
    pub fn next_delay(&self, item: T) -> Duration {
        let mut failures = self.failures.entry(item).or_insert(0);
        let exponent = (*failures).min(16);
        *failures = failures.saturating_add(1);

        let delay = self.base.as_secs_f64() * 2f64.powi(exponent as i32);
        // Jitter: 0.5x to 1.5x of the delay
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_secs_f64(delay * jitter).min(self.ceiling)
    }

    /// Reset the failure count of `item`
    pub fn forget(&self, item: &T) {
        self.failures.remove(item);
    }

    /// Failures recorded for `item` since its last success
    pub fn failures(&self, item: &T) -> u32 {
        self.failures.get(item).map(|f| *f).unwrap_or_default()
    }
}

// =============================================================================
// Workers
// =============================================================================

/// Worker pool settings
#[derive(Clone, Debug)]
pub struct WorkerOptions {
    /// Name used in logs
    pub name: String,
    /// Items processed in parallel
    pub concurrency: usize,
    /// First delay after a failure
    pub backoff_base: Duration,
    /// Upper bound for every requeue delay
    pub requeue_ceiling: Duration,
}

impl WorkerOptions {
    /// Options for the synchronizer `name` from the engine configuration
    pub fn from_config(name: impl Into<String>, config: &SyncConfig) -> Self {
        Self {
            name: name.into(),
            concurrency: config.max_concurrent_reconciles.max(1),
            backoff_base: config.error_backoff_base,
            requeue_ceiling: config.requeue_ceiling,
        }
    }
}

/// Process queue items until `cancel` fires, then wait for running items.
///
/// Each item runs in its own task holding a semaphore permit. A panic in
/// `reconcile` is logged and the item is retried like an error.
pub async fn run_workers<T, F, Fut>(
    queue: Arc<WorkQueue<T>>,
    options: WorkerOptions,
    cancel: CancellationToken,
    reconcile: F,
) where
    T: Clone + Eq + Hash + Display + Send + Sync + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Action>> + Send + 'static,
{
    let concurrency = options.concurrency.max(1);
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let reconcile = Arc::new(reconcile);
    let backoff = Arc::new(ErrorBackoff::new(
        options.backoff_base,
        options.requeue_ceiling,
    ));
    info!(syncer = %options.name, concurrency, "Starting workers");

    loop {
        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        let item = tokio::select! {
            _ = cancel.cancelled() => break,
            item = queue.get() => match item {
                Some(item) => item,
                None => break,
            },
        };

        let queue = queue.clone();
        let reconcile = reconcile.clone();
        let backoff = backoff.clone();
        let name = options.name.clone();
        let ceiling = options.requeue_ceiling;
        tokio::spawn(async move {
            let _permit = permit;
            let outcome = AssertUnwindSafe(async { reconcile(item.clone()).await })
                .catch_unwind()
                .await;
            queue.done(&item);

            match outcome {
                Ok(Ok(Action::AwaitChange)) => backoff.forget(&item),
                Ok(Ok(Action::RequeueAfter(delay))) => {
                    backoff.forget(&item);
                    queue.add_after(item, delay.min(ceiling));
                }
                Ok(Ok(Action::Requeue)) => {
                    let delay = backoff.next_delay(item.clone());
                    debug!(syncer = %name, request = %item, ?delay, "Requeue");
                    queue.add_after(item, delay);
                }
                Ok(Err(e)) => {
                    let delay = backoff.next_delay(item.clone());
                    if e.is_retryable() {
                        warn!(syncer = %name, request = %item, error = %e, ?delay, "Reconcile failed, retrying");
                    } else {
                        error!(syncer = %name, request = %item, error = %e, ?delay, "Reconcile failed");
                    }
                    queue.add_after(item, delay);
                }
                Err(_) => {
                    let delay = backoff.next_delay(item.clone());
                    error!(syncer = %name, request = %item, ?delay, "Reconcile panicked");
                    queue.add_after(item, delay);
                }
            }
        });
    }

    queue.shutdown();
    // Wait for running items to finish
    let _ = semaphore.acquire_many(concurrency as u32).await;
    info!(syncer = %options.name, "Workers stopped");
}
