//! In-process lock service

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{LockError, LockOptions, LockToken, Locker};

/// A held lock
struct LockRecord {
    owner: LockToken,
    /// Fired when the record is removed
    released: CancellationToken,
}

type LockMap = Arc<Mutex<HashMap<String, LockRecord>>>;

/// In-process implementation of [`Locker`]
///
/// The map mutex is only held for lookups and mutations. Waiters block on
/// the holder's release signal, so unlocking wakes all of them and they
/// race for the key again.
#[derive(Default)]
pub struct InMemoryLocker {
    locks: LockMap,
}

impl InMemoryLocker {
    /// Create an empty locker
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether `key` is currently held
    pub fn is_locked(&self, key: &str) -> bool {
        self.locks.lock().contains_key(key)
    }

    /// Get the number of held keys
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    /// Check if no key is held
    pub fn is_empty(&self) -> bool {
        self.locks.lock().is_empty()
    }

    /// Remove the record for `key` if `owner` still holds it
    fn remove_record(locks: &LockMap, key: &str, owner: &LockToken) -> bool {
        let mut locks = locks.lock();
        if !locks.get(key).is_some_and(|record| record.owner == *owner) {
            return false;
        }
        if let Some(record) = locks.remove(key) {
            record.released.cancel();
        }
        true
    }

    fn schedule_expiry(
        &self,
        key: String,
        owner: LockToken,
        released: CancellationToken,
        after: Duration,
    ) {
        let locks = Arc::clone(&self.locks);
        tokio::spawn(async move {
            tokio::select! {
                _ = released.cancelled() => {}
                _ = tokio::time::sleep(after) => {
                    if Self::remove_record(&locks, &key, &owner) {
                        debug!(%key, %owner, "Lock expired");
                    }
                }
            }
        });
    }
}

#[async_trait]
impl Locker for InMemoryLocker {
    async fn lock(
        &self,
        cancel: &CancellationToken,
        key: &str,
        options: LockOptions,
    ) -> Result<LockToken, LockError> {
        let mut attempts = 0u32;

        loop {
            let released = {
                let mut locks = self.locks.lock();
                let held = locks.get(key).map(|record| record.released.clone());
                match held {
                    Some(released) => released,
                    None => {
                        let owner = LockToken::generate();
                        let released = CancellationToken::new();
                        locks.insert(
                            key.to_string(),
                            LockRecord {
                                owner,
                                released: released.clone(),
                            },
                        );
                        drop(locks);

                        if let Some(after) = options.expiration {
                            self.schedule_expiry(key.to_string(), owner, released, after);
                        }
                        trace!(%key, %owner, attempts, "Lock acquired");
                        return Ok(owner);
                    }
                }
            };

            attempts += 1;
            if options.attempts_exhausted(attempts) {
                return Err(LockError::MaxAttempts);
            }

            tokio::select! {
                _ = released.cancelled() => {}
                _ = cancel.cancelled() => return Err(LockError::Cancelled),
            }
        }
    }

    async fn unlock(
        &self,
        _cancel: &CancellationToken,
        key: &str,
        token: &LockToken,
    ) -> Result<(), LockError> {
        self.release(key, token)
    }

    fn release(&self, key: &str, token: &LockToken) -> Result<(), LockError> {
        if Self::remove_record(&self.locks, key, token) {
            trace!(%key, %token, "Lock released");
            Ok(())
        } else {
            Err(LockError::NotFound)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const KEY: &str = "user-1-file";

    #[tokio::test]
    async fn test_lock_and_unlock() {
        let locker = InMemoryLocker::new();
        let cancel = CancellationToken::new();

        let token = locker.lock(&cancel, KEY, LockOptions::default()).await.unwrap();
        assert!(locker.is_locked(KEY));
        assert_eq!(locker.len(), 1);

        locker.unlock(&cancel, KEY, &token).await.unwrap();
        assert!(locker.is_empty());
    }

    #[tokio::test]
    async fn test_second_caller_waits_for_release() {
        let locker = Arc::new(InMemoryLocker::new());
        let cancel = CancellationToken::new();

        let token_a = locker.lock(&cancel, KEY, LockOptions::default()).await.unwrap();

        let waiter = {
            let locker = Arc::clone(&locker);
            let cancel = cancel.clone();
            tokio::spawn(async move { locker.lock(&cancel, KEY, LockOptions::default()).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        locker.unlock(&cancel, KEY, &token_a).await.unwrap();

        let token_b = waiter.await.unwrap().unwrap();
        assert_ne!(token_a, token_b);
        assert!(locker.is_locked(KEY));
    }

    #[tokio::test]
    async fn test_unlock_with_wrong_token_keeps_holder() {
        let locker = InMemoryLocker::new();
        let cancel = CancellationToken::new();

        let token = locker.lock(&cancel, KEY, LockOptions::default()).await.unwrap();
        let stranger = LockToken::generate();

        let result = locker.unlock(&cancel, KEY, &stranger).await;
        assert_eq!(result, Err(LockError::NotFound));
        assert!(locker.is_locked(KEY));

        locker.unlock(&cancel, KEY, &token).await.unwrap();
    }

    #[tokio::test]
    async fn test_unlock_twice_fails() {
        let locker = InMemoryLocker::new();
        let cancel = CancellationToken::new();

        let token = locker.lock(&cancel, KEY, LockOptions::default()).await.unwrap();
        locker.unlock(&cancel, KEY, &token).await.unwrap();

        assert_eq!(
            locker.unlock(&cancel, KEY, &token).await,
            Err(LockError::NotFound)
        );
    }

    #[tokio::test]
    async fn test_max_attempts_fails_without_waiting() {
        let locker = InMemoryLocker::new();
        let cancel = CancellationToken::new();
        let _token = locker.lock(&cancel, "k", LockOptions::default()).await.unwrap();

        let result = tokio::time::timeout(
            Duration::from_secs(1),
            locker.lock(&cancel, "k", LockOptions::new().with_max_attempts(1)),
        )
        .await
        .expect("must not wait for release");

        assert_eq!(result, Err(LockError::MaxAttempts));
    }

    #[tokio::test]
    async fn test_max_attempts_counts_each_wakeup() {
        let locker = Arc::new(InMemoryLocker::new());
        let cancel = CancellationToken::new();
        let first = locker.lock(&cancel, "k", LockOptions::default()).await.unwrap();

        let contender = {
            let locker = Arc::clone(&locker);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                locker
                    .lock(&cancel, "k", LockOptions::new().with_max_attempts(2))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Re-acquire before the woken contender runs so it finds the key held again
        locker.unlock(&cancel, "k", &first).await.unwrap();
        let _second = locker.lock(&cancel, "k", LockOptions::default()).await.unwrap();

        let result = contender.await.unwrap();
        assert_eq!(result, Err(LockError::MaxAttempts));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_wait() {
        let locker = Arc::new(InMemoryLocker::new());
        let cancel = CancellationToken::new();
        let _token = locker.lock(&cancel, KEY, LockOptions::default()).await.unwrap();

        let waiter_cancel = CancellationToken::new();
        let waiter = {
            let locker = Arc::clone(&locker);
            let waiter_cancel = waiter_cancel.clone();
            tokio::spawn(async move {
                locker
                    .lock(&waiter_cancel, KEY, LockOptions::default())
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        waiter_cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("cancelled waiter must return promptly")
            .unwrap();
        assert_eq!(result, Err(LockError::Cancelled));
        assert!(locker.is_locked(KEY));
    }

    #[tokio::test]
    async fn test_mutual_exclusion_under_contention() {
        let locker = Arc::new(InMemoryLocker::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let locker = Arc::clone(&locker);
            let inside = Arc::clone(&inside);
            let max_inside = Arc::clone(&max_inside);
            handles.push(tokio::spawn(async move {
                let cancel = CancellationToken::new();
                for _ in 0..10 {
                    let token = locker.lock(&cancel, KEY, LockOptions::default()).await.unwrap();
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                    locker.unlock(&cancel, KEY, &token).await.unwrap();
                }
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert!(locker.is_empty());
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_contend() {
        let locker = InMemoryLocker::new();
        let cancel = CancellationToken::new();

        let a = locker.lock(&cancel, "user-1-file", LockOptions::default()).await;
        let b = locker
            .lock(&cancel, "user-2-file", LockOptions::new().with_max_attempts(1))
            .await;
        assert!(a.is_ok());
        assert!(b.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiration_releases_lock() {
        let locker = Arc::new(InMemoryLocker::new());
        let cancel = CancellationToken::new();

        let token = locker
            .lock(
                &cancel,
                KEY,
                LockOptions::new().with_expiration(Duration::from_millis(100)),
            )
            .await
            .unwrap();

        let next = locker.lock(&cancel, KEY, LockOptions::default()).await.unwrap();
        assert_ne!(token, next);

        // The expired token can no longer release anything
        assert_eq!(
            locker.unlock(&cancel, KEY, &token).await,
            Err(LockError::NotFound)
        );
        assert!(locker.is_locked(KEY));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_does_not_touch_new_holder() {
        let locker = InMemoryLocker::new();
        let cancel = CancellationToken::new();

        let first = locker
            .lock(
                &cancel,
                KEY,
                LockOptions::new().with_expiration(Duration::from_millis(100)),
            )
            .await
            .unwrap();
        locker.unlock(&cancel, KEY, &first).await.unwrap();

        let second = locker.lock(&cancel, KEY, LockOptions::default()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(locker.is_locked(KEY));
        locker.unlock(&cancel, KEY, &second).await.unwrap();
    }
}
