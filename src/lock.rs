//! Bounded-wait lock shared by the scheduler and foreground calls.
//!
//! The scheduler only ever `try_lock`s and drops its tick on contention.
//! Foreground calls retry `try_lock` with a fixed sleep and give up with
//! [`AcqError::Busy`].

use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::error::{AcqError, AcqResult};

/// Mutex acquired with a bounded number of `try_lock` attempts.
pub struct AcqLock<T> {
    inner: Mutex<T>,
    retries: u32,
    retry_interval: Duration,
}

impl<T> AcqLock<T> {
    /// Wrap `value`; acquisition gives up after `retries` attempts `retry_interval` apart.
    pub fn new(value: T, retries: u32, retry_interval: Duration) -> Self {
        Self {
            inner: Mutex::new(value),
            retries,
            retry_interval,
        }
    }

    /// Single non-blocking attempt.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        self.inner.try_lock().ok()
    }

    /// Retry `try_lock` up to the configured number of times.
    pub async fn lock(&self) -> AcqResult<MutexGuard<'_, T>> {
        for attempt in 0..=self.retries {
            if let Ok(guard) = self.inner.try_lock() {
                return Ok(guard);
            }
            if attempt < self.retries {
                tokio::time::sleep(self.retry_interval).await;
            }
        }
        debug!(retries = self.retries, "Lock still contended, giving up");
        Err(AcqError::Busy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn try_lock_fails_while_held() {
        let lock = AcqLock::new(0u32, 0, Duration::from_millis(1));
        let guard = lock.try_lock().unwrap();
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn lock_gives_up_with_busy() {
        let lock = AcqLock::new(0u32, 3, Duration::from_millis(10));
        let _guard = lock.try_lock().unwrap();
        let started = tokio::time::Instant::now();
        assert!(matches!(lock.lock().await, Err(AcqError::Busy)));
        assert_eq!(started.elapsed(), Duration::from_millis(30));
    }

    #[tokio::test(start_paused = true)]
    async fn lock_succeeds_once_released() {
        let lock = std::sync::Arc::new(AcqLock::new(5u32, 10, Duration::from_millis(10)));
        let holder = lock.clone();
        let task = tokio::spawn(async move {
            let mut guard = holder.try_lock().unwrap();
            *guard += 1;
            tokio::time::sleep(Duration::from_millis(25)).await;
        });
        tokio::task::yield_now().await;

        let guard = lock.lock().await.unwrap();
        assert_eq!(*guard, 6);
        drop(guard);
        task.await.unwrap();
    }
}
