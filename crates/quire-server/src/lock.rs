//! The lock shared by rebuilds and request handling.

use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Held while the output directory is being written or read.
pub type BuildGuard = OwnedMutexGuard<()>;

/// Mutual exclusion between rebuilding and serving.
///
/// Cloning shares the same lock.
#[derive(Debug, Clone, Default)]
pub struct BuildLock {
    inner: Arc<Mutex<()>>,
}

impl BuildLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the lock.
    pub async fn acquire(&self) -> BuildGuard {
        Arc::clone(&self.inner).lock_owned().await
    }

    /// Take the lock if it is free.
    pub fn try_acquire(&self) -> Option<BuildGuard> {
        Arc::clone(&self.inner).try_lock_owned().ok()
    }

    pub fn is_locked(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn clones_share_one_lock() {
        let lock = BuildLock::new();
        let other = lock.clone();

        let guard = lock.acquire().await;
        assert!(other.is_locked());
        assert!(other.try_acquire().is_none());

        drop(guard);
        assert!(!other.is_locked());
        assert!(other.try_acquire().is_some());
    }

    #[tokio::test]
    async fn waiters_resume_after_release() {
        let lock = BuildLock::new();
        let guard = lock.acquire().await;

        let waiter = tokio::spawn({
            let lock = lock.clone();
            async move {
                let _guard = lock.acquire().await;
            }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
