//! FIFO mutual exclusion with named holders.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex, OwnedMutexGuard};
use tracing::warn;

use crate::config::defaults;

/// Async lock granting access in request order.
///
/// Every acquisition carries a name so a holder that keeps the lock too long
/// can be reported. The lock is never revoked.
#[derive(Clone)]
pub struct Lock {
    inner: Arc<Mutex<()>>,
    holder: Arc<parking_lot::Mutex<Option<String>>>,
    warn_after: Duration,
}

impl Lock {
    pub fn new() -> Self {
        Self::with_warn_threshold(Duration::from_secs(defaults::LOCK_WARN_SECS))
    }

    pub fn with_warn_threshold(warn_after: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(())),
            holder: Arc::new(parking_lot::Mutex::new(None)),
            warn_after,
        }
    }

    /// Wait for the lock. Waiters are served first come, first served.
    pub async fn acquire(&self, name: &str) -> LockGuard {
        let guard = self.inner.clone().lock_owned().await;
        *self.holder.lock() = Some(name.to_string());

        let (done_tx, done_rx) = oneshot::channel::<()>();
        let warn_after = self.warn_after;
        let holder = name.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = done_rx => {}
                _ = tokio::time::sleep(warn_after) => {
                    warn!(
                        holder = %holder,
                        threshold_secs = warn_after.as_secs(),
                        "Lock still held after threshold"
                    );
                }
            }
        });

        LockGuard {
            guard: Some(guard),
            holder: self.holder.clone(),
            watchdog: Some(done_tx),
        }
    }

    /// Name of the current holder, if any.
    pub fn holder(&self) -> Option<String> {
        self.holder.lock().clone()
    }

    pub fn is_locked(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}

/// Held lock. Released by [`LockGuard::release`] or on drop.
pub struct LockGuard {
    guard: Option<OwnedMutexGuard<()>>,
    holder: Arc<parking_lot::Mutex<Option<String>>>,
    watchdog: Option<oneshot::Sender<()>>,
}

impl LockGuard {
    /// Release the lock. Further calls do nothing.
    pub fn release(&mut self) {
        if let Some(guard) = self.guard.take() {
            *self.holder.lock() = None;
            self.watchdog.take();
            drop(guard);
        }
    }

    pub fn is_held(&self) -> bool {
        self.guard.is_some()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_single_holder() {
        let lock = Lock::new();
        let guard = lock.acquire("first").await;
        assert!(lock.is_locked());
        assert_eq!(lock.holder().as_deref(), Some("first"));

        drop(guard);
        assert!(!lock.is_locked());
        assert!(lock.holder().is_none());
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let lock = Lock::new();
        let mut guard = lock.acquire("holder").await;
        guard.release();
        guard.release();
        assert!(!guard.is_held());

        // A second acquisition does not see a stale holder.
        let other = lock.acquire("other").await;
        drop(guard);
        assert_eq!(lock.holder().as_deref(), Some("other"));
        drop(other);
    }

    #[tokio::test]
    async fn test_waiters_are_served_in_order() {
        let lock = Lock::new();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let first = lock.acquire("first").await;

        let mut tasks = Vec::new();
        for i in 0..4 {
            let lock = lock.clone();
            let order = order.clone();
            tasks.push(tokio::spawn(async move {
                let _guard = lock.acquire(&format!("waiter-{i}")).await;
                order.lock().push(i);
            }));
            // Let the waiter queue up before spawning the next one.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        drop(first);
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_long_holder_is_not_revoked() {
        let lock = Lock::with_warn_threshold(Duration::from_millis(10));
        let guard = lock.acquire("slow").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(guard.is_held());
        assert_eq!(lock.holder().as_deref(), Some("slow"));
    }
}
