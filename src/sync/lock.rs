//! The per-machine lock.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};

/// Mutual exclusion around one machine's logic.
///
/// Supports async, blocking and timed acquisition; release is scoped to the
/// returned [`MachineGuard`]. The lock counts holders so tests (and the
/// `overlaps` counter) can verify that no two activities ever held it at the
/// same time.
///
/// The lock is not reentrant: acquiring it again from the activity that holds
/// it deadlocks. Relays through other machines are caught earlier by the
/// call-chain detector in [`crate::chain`].
#[derive(Debug)]
pub struct MachineLock<T> {
    inner: Mutex<T>,
    holders: AtomicUsize,
    acquisitions: AtomicU64,
    overlaps: AtomicU64,
}

impl<T> MachineLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
            holders: AtomicUsize::new(0),
            acquisitions: AtomicU64::new(0),
            overlaps: AtomicU64::new(0),
        }
    }

    fn enter<'a>(&'a self, guard: MutexGuard<'a, T>) -> MachineGuard<'a, T> {
        if self.holders.fetch_add(1, Ordering::AcqRel) != 0 {
            self.overlaps.fetch_add(1, Ordering::Relaxed);
            tracing::error!("machine lock acquired while already held");
        }
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        MachineGuard { guard, lock: self }
    }

    pub async fn lock(&self) -> MachineGuard<'_, T> {
        let guard = self.inner.lock().await;
        self.enter(guard)
    }

    /// Must not be called from within an async execution context.
    pub fn blocking_lock(&self) -> MachineGuard<'_, T> {
        let guard = self.inner.blocking_lock();
        self.enter(guard)
    }

    pub fn try_lock(&self) -> Option<MachineGuard<'_, T>> {
        self.inner.try_lock().ok().map(|guard| self.enter(guard))
    }

    pub async fn lock_timeout(&self, timeout: Duration) -> Option<MachineGuard<'_, T>> {
        let guard = tokio::time::timeout(timeout, self.inner.lock()).await.ok()?;
        Some(self.enter(guard))
    }

    pub fn is_held(&self) -> bool {
        self.holders.load(Ordering::Acquire) != 0
    }

    pub fn acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::Relaxed)
    }

    /// Number of acquisitions that observed another holder. Always zero for a
    /// correct runtime.
    pub fn overlaps(&self) -> u64 {
        self.overlaps.load(Ordering::Relaxed)
    }
}

/// Scoped access to the locked value.
pub struct MachineGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    lock: &'a MachineLock<T>,
}

impl<T> Deref for MachineGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for MachineGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for MachineGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.holders.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn guard_releases_on_drop() {
        let lock = MachineLock::new(0u32);
        {
            let mut guard = lock.lock().await;
            *guard += 1;
            assert!(lock.is_held());
            assert!(lock.try_lock().is_none());
        }
        assert!(!lock.is_held());
        assert_eq!(*lock.lock().await, 1);
        assert_eq!(lock.acquisitions(), 2);
    }

    #[tokio::test]
    async fn lock_timeout_gives_up() {
        let lock = MachineLock::new(());
        let _held = lock.lock().await;
        let attempt = lock.lock_timeout(Duration::from_millis(20)).await;
        assert!(attempt.is_none());
    }

    #[test]
    fn blocking_acquisition_from_plain_threads() {
        let lock = Arc::new(MachineLock::new(0u64));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        *lock.blocking_lock() += 1;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*lock.blocking_lock(), 400);
        assert_eq!(lock.overlaps(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_tasks_never_overlap() {
        let lock = Arc::new(MachineLock::new(Vec::new()));
        let mut tasks = Vec::new();
        for i in 0..16 {
            let lock = Arc::clone(&lock);
            tasks.push(tokio::spawn(async move {
                let mut guard = lock.lock().await;
                guard.push(i);
                tokio::task::yield_now().await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(lock.lock().await.len(), 16);
        assert_eq!(lock.overlaps(), 0);
    }
}
