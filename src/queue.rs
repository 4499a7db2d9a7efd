//! Keyed work queue for the controllers
//!
//! A deduplicating queue of opaque string keys. A key added while already
//! pending is coalesced; a key added while in flight is remembered and
//! redelivered once the current processing round calls [`WorkQueue::done`].
//! No two workers ever hold the same key at the same time.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

const BASE_DELAY: Duration = Duration::from_millis(5);
const MAX_DELAY: Duration = Duration::from_secs(1000);

pub struct WorkQueue {
    name: &'static str,
    inner: Mutex<Inner>,
    notify: Notify,
    shutting_down: AtomicBool,
    weak_self: Weak<WorkQueue>,
}

#[derive(Default)]
struct Inner {
    /// Delivery order of pending keys.
    queue: VecDeque<String>,
    /// Keys that are pending or need redelivery after `done`.
    dirty: HashSet<String>,
    /// Keys currently held by a worker.
    processing: HashSet<String>,
    /// Consecutive failures per key, reset by `forget`.
    failures: HashMap<String, u32>,
}

impl WorkQueue {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| WorkQueue {
            name,
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            shutting_down: AtomicBool::new(false),
            weak_self: weak_self.clone(),
        })
    }

    /// Adds `key` for processing. Idempotent while the key is pending.
    pub fn add(&self, key: impl Into<String>) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let key = key.into();
        {
            let mut inner = self.inner.lock();
            if !inner.dirty.insert(key.clone()) {
                return;
            }
            if inner.processing.contains(&key) {
                // Redelivered by `done`.
                return;
            }
            inner.queue.push_back(key);
        }
        self.notify.notify_one();
    }

    /// Re-adds `key` after a failure, delayed by an exponential per-key
    /// backoff.
    pub fn add_rate_limited(&self, key: impl Into<String>) {
        let key = key.into();
        let delay = {
            let mut inner = self.inner.lock();
            let failures = inner.failures.entry(key.clone()).or_insert(0);
            let delay = backoff(*failures);
            *failures += 1;
            delay
        };
        debug!(queue = self.name, key = %key, ?delay, "requeueing after failure");
        if let Some(queue) = self.weak_self.upgrade() {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                queue.add(key);
            });
        }
    }

    /// Resets the failure counter for `key`.
    pub fn forget(&self, key: &str) {
        self.inner.lock().failures.remove(key);
    }

    /// Blocks until a key is available and marks it in flight. Returns `None`
    /// once the queue has shut down and drained.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock();
                if let Some(key) = inner.queue.pop_front() {
                    inner.dirty.remove(&key);
                    inner.processing.insert(key.clone());
                    // Wake the next waiter in case more keys are pending.
                    if !inner.queue.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
                if self.shutting_down.load(Ordering::SeqCst) {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Releases `key` after processing. Must be called exactly once per
    /// successful [`WorkQueue::get`]. Redelivers the key if it was re-added
    /// while in flight.
    pub fn done(&self, key: &str) {
        let redeliver = {
            let mut inner = self.inner.lock();
            inner.processing.remove(key);
            if inner.dirty.contains(key) {
                inner.queue.push_back(key.to_string());
                true
            } else {
                false
            }
        };
        if redeliver {
            self.notify.notify_one();
        }
    }

    /// Stops accepting new keys and unblocks waiting workers once the
    /// remaining keys are drained.
    pub fn shut_down(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn backoff(failures: u32) -> Duration {
    let exp = failures.min(28);
    let delay = BASE_DELAY * 2u32.pow(exp);
    delay.min(MAX_DELAY)
}
