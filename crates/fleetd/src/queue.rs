//! De-duplicating work queue of group names.
//!
//! A key is held by at most one worker at a time. Adding a key that is
//! already queued is a no-op; adding a key that is in flight marks it dirty
//! and it is queued again when the worker calls [`WorkQueue::done`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

/// Why a key was enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkReason {
    Startup,
    Resync,
    Requeue,
}

impl fmt::Display for WorkReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WorkReason::Startup => "startup",
            WorkReason::Resync => "resync",
            WorkReason::Requeue => "requeue",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub key: String,
    pub reason: WorkReason,
}

#[derive(Debug, Default)]
struct Inner {
    ready: VecDeque<WorkItem>,
    queued: HashSet<String>,
    in_flight: HashSet<String>,
    dirty: HashMap<String, WorkReason>,
    /// Earliest pending delayed add per key.
    delayed: HashMap<String, Instant>,
    shut_down: bool,
}

#[derive(Debug, Default)]
pub struct WorkQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn add(&self, key: &str, reason: WorkReason) {
        let mut inner = self.lock();
        if inner.shut_down || inner.queued.contains(key) {
            return;
        }
        if inner.in_flight.contains(key) {
            inner.dirty.entry(key.to_string()).or_insert(reason);
            return;
        }
        inner.queued.insert(key.to_string());
        inner.ready.push_back(WorkItem {
            key: key.to_string(),
            reason,
        });
        drop(inner);
        self.notify.notify_one();
    }

    /// Add `key` after `delay`. Only the earliest pending delayed add per
    /// key is kept.
    pub fn add_after(self: &Arc<Self>, key: &str, reason: WorkReason, delay: Duration) {
        let due = Instant::now() + delay;
        {
            let mut inner = self.lock();
            if inner.shut_down {
                return;
            }
            if inner.delayed.get(key).is_some_and(|at| *at <= due) {
                return;
            }
            inner.delayed.insert(key.to_string(), due);
        }
        let queue = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep_until(due).await;
            let fire = {
                let mut inner = queue.lock();
                if inner.delayed.get(&key) == Some(&due) {
                    inner.delayed.remove(&key);
                    true
                } else {
                    false
                }
            };
            if fire {
                queue.add(&key, reason);
            }
        });
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    pub async fn next(&self) -> Option<WorkItem> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.lock();
                if inner.shut_down {
                    return None;
                }
                if let Some(item) = inner.ready.pop_front() {
                    inner.queued.remove(&item.key);
                    inner.in_flight.insert(item.key.clone());
                    if !inner.ready.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some(item);
                }
            }
            notified.await;
        }
    }

    /// Release `key` after processing; re-queues it if it was added while
    /// in flight.
    pub fn done(&self, key: &str) {
        let requeue = {
            let mut inner = self.lock();
            inner.in_flight.remove(key);
            inner.dirty.remove(key)
        };
        if let Some(reason) = requeue {
            self.add(key, reason);
        }
    }

    /// Stop handing out work. Waiting workers return `None`.
    pub fn shutdown(&self) {
        let mut inner = self.lock();
        inner.shut_down = true;
        inner.ready.clear();
        inner.queued.clear();
        inner.delayed.clear();
        drop(inner);
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.lock().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deduplicates_queued_keys() {
        let q = WorkQueue::new();
        q.add("web", WorkReason::Resync);
        q.add("web", WorkReason::Requeue);
        q.add("api", WorkReason::Resync);
        assert_eq!(q.len(), 2);

        let first = q.next().await.unwrap();
        assert_eq!(first.key, "web");
        assert_eq!(first.reason, WorkReason::Resync);
        assert_eq!(q.next().await.unwrap().key, "api");
    }

    #[tokio::test]
    async fn in_flight_key_is_requeued_after_done() {
        let q = WorkQueue::new();
        q.add("web", WorkReason::Startup);
        let item = q.next().await.unwrap();

        q.add("web", WorkReason::Resync);
        assert!(q.is_empty());
        assert_eq!(q.in_flight(), 1);

        q.done(&item.key);
        assert_eq!(q.in_flight(), 0);
        let again = q.next().await.unwrap();
        assert_eq!(again.key, "web");
        assert_eq!(again.reason, WorkReason::Resync);
    }

    #[tokio::test]
    async fn delayed_add_fires_once() {
        let q = WorkQueue::new();
        q.add_after("web", WorkReason::Requeue, Duration::from_millis(20));
        q.add_after("web", WorkReason::Requeue, Duration::from_millis(10));
        assert!(q.is_empty());

        let item = tokio::time::timeout(Duration::from_secs(2), q.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.reason, WorkReason::Requeue);
        q.done(&item.key);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn shutdown_wakes_waiting_workers() {
        let q = WorkQueue::new();
        let worker = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.next().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.shutdown();
        assert_eq!(worker.await.unwrap(), None);

        q.add("web", WorkReason::Resync);
        assert!(q.is_empty());
    }
}
