//! Bounded worker pool for the asynchronous entry points.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::config::PoolConfig;
use crate::error::{BridgeError, Result};

/// Decrements the outstanding count when a job finishes, however it ends.
struct Slot(Arc<AtomicUsize>);

impl Drop for Slot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// At most `max_workers` jobs run at once and at most `queue_capacity` more
/// wait for a worker. Anything beyond that is rejected at submission.
pub struct WorkerPool {
    workers: Arc<Semaphore>,
    max_workers: usize,
    queue_capacity: usize,
    outstanding: Arc<AtomicUsize>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl WorkerPool {
    pub fn new(max_workers: usize, queue_capacity: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            workers: Arc::new(Semaphore::new(max_workers)),
            max_workers,
            queue_capacity,
            outstanding: Arc::new(AtomicUsize::new(0)),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn from_config(config: &PoolConfig) -> Self {
        Self::new(config.max_workers, config.queue_capacity)
    }

    /// Jobs accepted and not yet finished (running or queued)
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.tracker.is_closed()
    }

    /// Submit a job. It receives a token that fires if the pool is shut down
    /// before the job finishes.
    pub fn submit<F, Fut, T>(&self, job: F) -> Result<JoinHandle<T>>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if self.tracker.is_closed() {
            return Err(BridgeError::PoolClosed);
        }

        let limit = self.max_workers + self.queue_capacity;
        let admitted = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            });
        if let Err(current) = admitted {
            let pending = current.saturating_sub(self.max_workers);
            warn!(
                "Worker pool saturated: {} running, {} queued",
                self.max_workers, pending
            );
            return Err(BridgeError::PoolSaturated { pending });
        }

        let slot = Slot(self.outstanding.clone());
        let workers = self.workers.clone();
        let token = self.shutdown.child_token();

        Ok(self.tracker.spawn(async move {
            let _slot = slot;
            // The semaphore is never closed, so acquisition only waits.
            let _permit = workers.acquire_owned().await.ok();
            job(token).await
        }))
    }

    /// Stop accepting work and wait up to `grace` for accepted jobs. Jobs
    /// still running afterwards are cancelled and awaited. Returns whether
    /// everything drained within the grace period.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.tracker.close();
        info!(
            "Worker pool shutting down, waiting up to {}s for {} job(s)",
            grace.as_secs(),
            self.outstanding()
        );

        if tokio::time::timeout(grace, self.tracker.wait()).await.is_ok() {
            info!("Worker pool drained");
            return true;
        }

        warn!(
            "Worker pool did not drain within {}s, cancelling {} job(s)",
            grace.as_secs(),
            self.outstanding()
        );
        self.shutdown.cancel();
        self.tracker.wait().await;
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[tokio::test]
    async fn rejects_beyond_workers_plus_queue() {
        let pool = WorkerPool::new(1, 1);
        let gate = CancellationToken::new();

        let g1 = gate.clone();
        let first = pool.submit(move |_| async move { g1.cancelled().await });
        let g2 = gate.clone();
        let second = pool.submit(move |_| async move { g2.cancelled().await });
        let third = pool.submit(|_| async {});

        assert!(first.is_ok());
        assert!(second.is_ok());
        assert!(matches!(
            third,
            Err(BridgeError::PoolSaturated { pending: 1 })
        ));
        assert_eq!(pool.outstanding(), 2);

        gate.cancel();
        assert!(pool.shutdown(Duration::from_secs(5)).await);
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn runs_at_most_max_workers_concurrently() {
        let pool = WorkerPool::new(2, 10);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let running = running.clone();
            let peak = peak.clone();
            handles.push(
                pool.submit(move |_| async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .unwrap(),
            );
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn shutdown_cancels_jobs_that_outlive_grace() {
        let pool = WorkerPool::new(1, 0);
        let saw_cancel = Arc::new(AtomicBool::new(false));
        let flag = saw_cancel.clone();
        let handle = pool
            .submit(move |token| async move {
                token.cancelled().await;
                flag.store(true, Ordering::SeqCst);
            })
            .unwrap();

        assert!(!pool.shutdown(Duration::from_millis(50)).await);
        handle.await.unwrap();
        assert!(saw_cancel.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn closed_pool_rejects_submissions() {
        let pool = WorkerPool::new(1, 1);
        assert!(pool.shutdown(Duration::from_millis(10)).await);
        assert!(pool.is_closed());
        assert!(matches!(
            pool.submit(|_| async {}),
            Err(BridgeError::PoolClosed)
        ));
    }
}
