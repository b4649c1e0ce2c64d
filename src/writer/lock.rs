//! Global write lock
//!
//! One commit at a time, granted in arrival order (tokio's mutex is fair).
//! The lock counts acquisitions and flags any overlap between holders.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{error, trace};

#[derive(Debug, Default)]
struct LockStats {
    acquisitions: AtomicU64,
    holders: AtomicUsize,
    overlaps: AtomicU64,
    waiting: AtomicUsize,
}

#[derive(Clone, Default)]
pub struct WriteLock {
    mutex: Arc<Mutex<()>>,
    stats: Arc<LockStats>,
}

impl WriteLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the lock
    pub async fn acquire(&self) -> WriteGuard {
        self.stats.waiting.fetch_add(1, Ordering::SeqCst);
        let guard = self.mutex.clone().lock_owned().await;
        self.granted(guard)
    }

    /// Block the current thread until the lock is granted.
    ///
    /// Panics when called from an async context; use from blocking code only.
    pub fn blocking_acquire(&self) -> WriteGuard {
        self.stats.waiting.fetch_add(1, Ordering::SeqCst);
        let guard = self.mutex.clone().blocking_lock_owned();
        self.granted(guard)
    }

    fn granted(&self, guard: OwnedMutexGuard<()>) -> WriteGuard {
        self.stats.waiting.fetch_sub(1, Ordering::SeqCst);
        let count = self.stats.acquisitions.fetch_add(1, Ordering::SeqCst) + 1;
        let holders = self.stats.holders.fetch_add(1, Ordering::SeqCst);
        if holders > 0 {
            self.stats.overlaps.fetch_add(1, Ordering::SeqCst);
            error!(holders = holders + 1, "Write lock held by more than one writer");
        }
        trace!(acquisition = count, "Write lock granted");
        WriteGuard {
            _guard: guard,
            stats: self.stats.clone(),
            acquired_at: Instant::now(),
        }
    }

    /// Total number of times the lock was granted
    pub fn acquisitions(&self) -> u64 {
        self.stats.acquisitions.load(Ordering::SeqCst)
    }

    /// Number of grants that happened while another guard was alive
    pub fn overlaps(&self) -> u64 {
        self.stats.overlaps.load(Ordering::SeqCst)
    }

    /// Writers queued for the lock
    pub fn waiting(&self) -> usize {
        self.stats.waiting.load(Ordering::SeqCst)
    }

    pub fn is_held(&self) -> bool {
        self.stats.holders.load(Ordering::SeqCst) > 0
    }

    /// Whether `guard` was granted by this lock
    pub fn owns(&self, guard: &WriteGuard) -> bool {
        Arc::ptr_eq(&self.stats, &guard.stats)
    }
}

/// Held write lock, released on drop
pub struct WriteGuard {
    _guard: OwnedMutexGuard<()>,
    stats: Arc<LockStats>,
    acquired_at: Instant,
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        self.stats.holders.fetch_sub(1, Ordering::SeqCst);
        trace!(held_ms = self.acquired_at.elapsed().as_millis() as u64, "Write lock released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_grants_in_arrival_order() {
        let lock = WriteLock::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let first = lock.acquire().await;
        let mut handles = Vec::new();
        for i in 0..5 {
            let task_lock = lock.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _guard = task_lock.acquire().await;
                order.lock().unwrap().push(i);
            }));
            // Let each task queue before spawning the next
            while lock.waiting() < i + 1 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }
        drop(first);
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(lock.acquisitions(), 6);
        assert_eq!(lock.overlaps(), 0);
        assert!(!lock.is_held());
    }

    #[test]
    fn test_blocking_acquire() {
        let lock = WriteLock::new();
        {
            let _guard = lock.blocking_acquire();
            assert!(lock.is_held());
        }
        assert!(!lock.is_held());
        assert_eq!(lock.acquisitions(), 1);

        let other = WriteLock::new();
        let guard = other.blocking_acquire();
        assert!(other.owns(&guard));
        assert!(!lock.owns(&guard));
    }
}
