//! Bounded worker pool with blocking admission.
//!
//! Submitting a job waits for a free slot, which is the only backpressure a
//! node applies to its own download loop. Shutdown stops admission and waits
//! for the running jobs to finish; jobs are never aborted.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Errors returned by the worker pool.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("Worker pool is shutting down")]
    ShuttingDown,
}

/// Fixed-size pool of concurrently running async jobs.
pub struct WorkerPool {
    size: usize,
    slots: Arc<Semaphore>,
    jobs: Mutex<JoinSet<()>>,
    closed: AtomicBool,
}

impl WorkerPool {
    /// Creates a pool admitting at most `size` concurrent jobs.
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            size,
            slots: Arc::new(Semaphore::new(size)),
            jobs: Mutex::new(JoinSet::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of jobs currently holding a slot.
    pub fn active(&self) -> usize {
        self.size - self.slots.available_permits()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Submits a job, waiting for a free slot when the pool is saturated.
    ///
    /// # Errors
    /// - `PoolError::ShuttingDown` - The pool was shut down before or while waiting
    pub async fn submit<F>(&self, job: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_closed() {
            return Err(PoolError::ShuttingDown);
        }

        let permit = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::ShuttingDown)?;

        let mut jobs = self.jobs.lock();
        // Shutdown may have taken the set while this submitter held a permit.
        if self.is_closed() {
            return Err(PoolError::ShuttingDown);
        }
        // Reap finished jobs so the set does not grow over a long run.
        while let Some(result) = jobs.try_join_next() {
            if let Err(e) = result {
                tracing::warn!("Worker job failed: {}", e);
            }
        }
        jobs.spawn(async move {
            let _permit = permit;
            job.await;
        });

        Ok(())
    }

    /// Stops admission and waits for running jobs to drain.
    ///
    /// Submitters blocked on a saturated pool are released with
    /// `PoolError::ShuttingDown`. Calling this more than once is harmless.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.slots.close();

        let mut jobs = std::mem::take(&mut *self.jobs.lock());
        while let Some(result) = jobs.join_next().await {
            if let Err(e) = result {
                tracing::warn!("Worker job failed during drain: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.size)
            .field("active", &self.active())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_runs_submitted_jobs() {
        let pool = WorkerPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            pool.submit(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();
        }

        pool.shutdown().await;
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_submit_blocks_when_saturated() {
        let pool = Arc::new(WorkerPool::new(2));
        let gate = Arc::new(tokio::sync::Notify::new());

        for _ in 0..2 {
            let gate = Arc::clone(&gate);
            pool.submit(async move { gate.notified().await }).await.unwrap();
        }
        assert_eq!(pool.active(), 2);

        let blocked = tokio::time::timeout(Duration::from_millis(50), pool.submit(async {})).await;
        assert!(blocked.is_err(), "submission should wait for a free slot");

        gate.notify_waiters();
        let admitted = tokio::time::timeout(Duration::from_secs(1), pool.submit(async {})).await;
        assert_eq!(admitted, Ok(Ok(())));

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_drains_running_jobs() {
        let pool = WorkerPool::new(3);
        let finished = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let finished = Arc::clone(&finished);
            pool.submit(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                finished.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();
        }

        pool.shutdown().await;
        assert_eq!(finished.load(Ordering::SeqCst), 3);
        assert_eq!(pool.submit(async {}).await, Err(PoolError::ShuttingDown));
    }

    #[tokio::test]
    async fn test_shutdown_releases_blocked_submitter() {
        let pool = Arc::new(WorkerPool::new(1));
        let gate = Arc::new(tokio::sync::Notify::new());

        let held = Arc::clone(&gate);
        pool.submit(async move { held.notified().await }).await.unwrap();

        let waiting_pool = Arc::clone(&pool);
        let waiter = tokio::spawn(async move { waiting_pool.submit(async {}).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let shutdown_pool = Arc::clone(&pool);
        let shutdown = tokio::spawn(async move { shutdown_pool.shutdown().await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(waiter.await.unwrap(), Err(PoolError::ShuttingDown));
        gate.notify_waiters();
        shutdown.await.unwrap();
    }
}
