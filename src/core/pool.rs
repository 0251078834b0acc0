use crate::core::errors::{BearError, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

/// Bounded pool of workers that party timelines run on.
///
/// Each permit stands for one worker. Permits are held for the whole
/// lifetime of the unit of work, so a pool with fewer permits than parties
/// serialises the surplus parties behind the running ones.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    capacity: usize,
    semaphore: Arc<Semaphore>,

    // Current usage counters
    active: AtomicUsize,

    // Statistics
    peak_active: AtomicUsize,
    total_started: AtomicU64,
}

/// Snapshot of pool usage
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub active: usize,
    pub peak_active: usize,
    pub total_started: u64,
    pub shut_down: bool,
}

impl WorkerPool {
    pub fn new(max_workers: usize) -> Result<Self> {
        if max_workers == 0 {
            return Err(BearError::configuration_field(
                "max_workers must be greater than 0",
                "max_workers",
            ));
        }

        Ok(Self {
            inner: Arc::new(PoolInner {
                capacity: max_workers,
                semaphore: Arc::new(Semaphore::new(max_workers)),
                active: AtomicUsize::new(0),
                peak_active: AtomicUsize::new(0),
                total_started: AtomicU64::new(0),
            }),
        })
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Wait for a free worker.
    ///
    /// Fails once the pool has been shut down, including for callers that
    /// were already queued.
    pub async fn acquire(&self) -> Result<WorkerPermit> {
        let permit = self
            .inner
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BearError::pool_shutdown("acquire worker"))?;

        let active = self.inner.active.fetch_add(1, Ordering::Relaxed) + 1;
        self.inner.peak_active.fetch_max(active, Ordering::Relaxed);
        self.inner.total_started.fetch_add(1, Ordering::Relaxed);
        debug!("Worker acquired, active: {}", active);

        Ok(WorkerPermit {
            pool: self.inner.clone(),
            _permit: permit,
            started: Instant::now(),
        })
    }

    /// Stop handing out workers. Work already running is not interrupted.
    pub fn shutdown(&self) {
        if !self.inner.semaphore.is_closed() {
            info!("Worker pool shutting down (capacity {})", self.inner.capacity);
            self.inner.semaphore.close();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.semaphore.is_closed()
    }

    /// Get current usage statistics
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.inner.capacity,
            active: self.inner.active.load(Ordering::Relaxed),
            peak_active: self.inner.peak_active.load(Ordering::Relaxed),
            total_started: self.inner.total_started.load(Ordering::Relaxed),
            shut_down: self.is_shut_down(),
        }
    }
}

/// RAII guard for one running worker
#[derive(Debug)]
pub struct WorkerPermit {
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
    started: Instant,
}

impl Drop for WorkerPermit {
    fn drop(&mut self) {
        let active = self
            .pool
            .active
            .fetch_sub(1, Ordering::Relaxed)
            .saturating_sub(1);
        debug!(
            "Worker released, active: {}, held for {:?}",
            active,
            self.started.elapsed()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_workers_rejected() {
        let err = WorkerPool::new(0).unwrap_err();
        assert_eq!(err.category(), "configuration");
    }

    #[tokio::test]
    async fn test_permit_accounting() {
        let pool = WorkerPool::new(2).unwrap();

        let first = pool.acquire().await.unwrap();
        let second = pool.acquire().await.unwrap();
        assert_eq!(pool.stats().active, 2);

        drop(first);
        assert_eq!(pool.stats().active, 1);
        drop(second);

        let stats = pool.stats();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.peak_active, 2);
        assert_eq!(stats.total_started, 2);
        assert!(!stats.shut_down);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_waiters() {
        let pool = WorkerPool::new(1).unwrap();
        let held = pool.acquire().await.unwrap();

        let waiting = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
        };

        tokio::task::yield_now().await;
        pool.shutdown();
        drop(held);

        let result = waiting.await.unwrap();
        assert!(matches!(result, Err(BearError::PoolShutdown { .. })));
        assert!(pool.is_shut_down());
    }
}
