//! Fixed-size worker pool.
//!
//! Request handling and pub/sub deliveries share a bounded number of
//! workers. Spawning never blocks the caller: work beyond the limit waits
//! for a free permit inside its own task. Long-lived loops run outside the
//! limit so they cannot starve request handling. Shutdown drains in-flight
//! work rather than aborting it.

use remora_core::Value;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

/// Default number of workers.
pub const DEFAULT_WORKERS: usize = 20;

/// Snapshot reported by `ro_workerStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Worker limit.
    pub workers: usize,
    /// Tasks currently holding a worker.
    pub busy: usize,
    /// Tasks waiting for a worker.
    pub queued: usize,
    /// Long-lived loops running outside the limit.
    pub background: usize,
    pub closed: bool,
}

impl PoolStatus {
    pub fn to_value(self) -> Value {
        Value::from_pairs([
            ("workers", Value::from(self.workers)),
            ("busy", Value::from(self.busy)),
            ("queued", Value::from(self.queued)),
            ("background", Value::from(self.background)),
            ("closed", Value::Bool(self.closed)),
        ])
    }
}

struct PoolInner {
    workers: usize,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    busy: AtomicUsize,
    queued: AtomicUsize,
    background: AtomicUsize,
    idle: Notify,
}

impl PoolInner {
    fn pending(&self) -> usize {
        self.busy.load(Ordering::SeqCst) + self.queued.load(Ordering::SeqCst)
    }
}

/// Bounded pool of tokio tasks.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(DEFAULT_WORKERS)
    }
}

impl WorkerPool {
    /// Create a pool with `workers` permits (at least one).
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            inner: Arc::new(PoolInner {
                workers,
                permits: Arc::new(Semaphore::new(workers)),
                tracker: TaskTracker::new(),
                busy: AtomicUsize::new(0),
                queued: AtomicUsize::new(0),
                background: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    /// Run `fut` on a worker once one is free.
    pub fn spawn<F>(&self, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let inner = self.inner.clone();
        inner.queued.fetch_add(1, Ordering::SeqCst);

        self.inner.tracker.spawn(async move {
            let _permit = inner.permits.clone().acquire_owned().await.ok();
            inner.busy.fetch_add(1, Ordering::SeqCst);
            inner.queued.fetch_sub(1, Ordering::SeqCst);
            let _busy = BusyGuard(inner.clone());
            fut.await
        })
    }

    /// Run a long-lived loop outside the worker limit.
    pub fn spawn_background<F>(&self, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let inner = self.inner.clone();
        inner.background.fetch_add(1, Ordering::SeqCst);
        self.inner.tracker.spawn(async move {
            let output = fut.await;
            inner.background.fetch_sub(1, Ordering::SeqCst);
            output
        })
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            workers: self.inner.workers,
            busy: self.inner.busy.load(Ordering::SeqCst),
            queued: self.inner.queued.load(Ordering::SeqCst),
            background: self.inner.background.load(Ordering::SeqCst),
            closed: self.inner.tracker.is_closed(),
        }
    }

    /// Wait until no worker task is queued or running.
    ///
    /// Background loops are not waited for.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.pending() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting the pool as open and wait for every task to finish.
    pub async fn shutdown(&self) {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }
}

/// Releases the busy count even if the task panics.
struct BusyGuard(Arc<PoolInner>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        if self.0.busy.fetch_sub(1, Ordering::SeqCst) == 1 && self.0.pending() == 0 {
            self.0.idle.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_limit_is_respected() {
        let pool = WorkerPool::new(2);
        let peak = Arc::new(AtomicUsize::new(0));
        let running = Arc::new(AtomicUsize::new(0));

        for _ in 0..6 {
            let peak = peak.clone();
            let running = running.clone();
            pool.spawn(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            });
        }

        pool.wait_idle().await;
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(pool.status().busy, 0);
        assert_eq!(pool.status().queued, 0);
    }

    #[tokio::test]
    async fn test_background_tasks_do_not_use_workers() {
        let pool = WorkerPool::new(1);
        let gate = Arc::new(Notify::new());
        let waiter = gate.clone();
        pool.spawn_background(async move { waiter.notified().await });

        let handle = pool.spawn(async { 7 });
        assert_eq!(handle.await.unwrap(), 7);
        assert_eq!(pool.status().background, 1);

        gate.notify_one();
        pool.shutdown().await;
        let status = pool.status();
        assert!(status.closed);
        assert_eq!(status.background, 0);
    }

    #[tokio::test]
    async fn test_panicking_task_releases_worker() {
        let pool = WorkerPool::new(1);
        let handle = pool.spawn(async { panic!("handler blew up") });
        assert!(handle.await.unwrap_err().is_panic());

        pool.wait_idle().await;
        assert_eq!(pool.spawn(async { 1 }).await.unwrap(), 1);
    }
}
