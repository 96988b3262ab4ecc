//! Key-scoped mutual exclusion
//!
//! This module provides:
//! - [`Locker`] - Lock service trait
//! - [`InMemoryLocker`] - In-process implementation
//! - [`LockerRegistry`] - Backend lookup by name
//!
//! # Example
//!
//! ```ignore
//! use filehost_sync::locker::{user_file_lock_key, InMemoryLocker, LockOptions, Locker};
//!
//! let locker = InMemoryLocker::new();
//! let cancel = CancellationToken::new();
//! let key = user_file_lock_key(42);
//!
//! let token = locker.lock(&cancel, &key, LockOptions::default()).await?;
//! // ... mutate the user's file tree ...
//! locker.unlock(&cancel, &key, &token).await?;
//! ```

mod memory;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use uuid::Uuid;

pub use memory::InMemoryLocker;

/// Name of the in-process backend
pub const MEMORY_LOCKER: &str = "memory";

/// Lock errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    /// The caller's cancellation token fired while waiting
    #[error("lock wait was cancelled")]
    Cancelled,

    /// The key stayed held for the allowed number of attempts
    #[error("maximum number of attempts reached")]
    MaxAttempts,

    /// No lock for this key is held with the given token
    #[error("lock does not exist")]
    NotFound,

    /// No backend registered under this name
    #[error("unknown locker backend: {0}")]
    UnknownBackend(String),
}

/// Opaque proof of lock ownership
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockToken(Uuid);

impl LockToken {
    pub(crate) fn generate() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Options for a single lock call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockOptions {
    /// Give up once the key was found held this many times (0 = unlimited)
    pub max_attempts: u32,

    /// Release the lock automatically after this long
    pub expiration: Option<Duration>,
}

impl LockOptions {
    /// Create default options (unlimited attempts, no expiry)
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit the number of contended attempts
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Expire the lock after the given duration
    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = Some(expiration);
        self
    }

    pub(crate) fn attempts_exhausted(&self, attempts: u32) -> bool {
        self.max_attempts > 0 && attempts >= self.max_attempts
    }
}

/// Key-scoped lock service
///
/// At most one holder per key. Only the token returned by `lock` can
/// release it.
#[async_trait]
pub trait Locker: Send + Sync {
    /// Acquire `key`, waiting while it is held
    async fn lock(
        &self,
        cancel: &CancellationToken,
        key: &str,
        options: LockOptions,
    ) -> Result<LockToken, LockError>;

    /// Release `key` if `token` is its current owner
    async fn unlock(
        &self,
        cancel: &CancellationToken,
        key: &str,
        token: &LockToken,
    ) -> Result<(), LockError>;

    /// Release `key` without waiting
    ///
    /// Used when a holder goes away before it could call `unlock`.
    fn release(&self, key: &str, token: &LockToken) -> Result<(), LockError>;

    /// Release backend resources
    fn close(&self) -> Result<(), LockError> {
        Ok(())
    }
}

/// Lock key guarding every mutation of one user's file tree
pub fn user_file_lock_key(uid: u64) -> String {
    format!("user-{}-file", uid)
}

/// Run `work` while holding `key`
///
/// The lock is released after `work` completes. A failed release is logged
/// and reported only when `work` itself succeeded. If the returned future is
/// dropped early or `work` panics, the lock is released on drop.
pub async fn with_lock<L, F, T, E>(
    locker: &L,
    cancel: &CancellationToken,
    key: &str,
    options: LockOptions,
    work: F,
) -> Result<T, E>
where
    L: Locker + ?Sized,
    F: Future<Output = Result<T, E>>,
    E: From<LockError>,
{
    let token = locker.lock(cancel, key, options).await?;
    let mut held = HeldLock {
        locker,
        key,
        token,
        armed: true,
    };
    let result = work.await;
    held.armed = false;

    if let Err(e) = locker.unlock(cancel, key, &token).await {
        error!(%key, %token, error = %e, "Failed to release lock");
        if result.is_ok() {
            return Err(e.into());
        }
    }
    result
}

/// Releases an abandoned lock when dropped while armed
struct HeldLock<'a, L: Locker + ?Sized> {
    locker: &'a L,
    key: &'a str,
    token: LockToken,
    armed: bool,
}

impl<L: Locker + ?Sized> Drop for HeldLock<'_, L> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match self.locker.release(self.key, &self.token) {
            Ok(()) => warn!(key = %self.key, token = %self.token, "Released abandoned lock"),
            Err(e) => error!(
                key = %self.key,
                token = %self.token,
                error = %e,
                "Failed to release abandoned lock"
            ),
        }
    }
}

/// Factory creating a locker backend from its config string
pub type LockerFactory = Box<dyn Fn(&str) -> Result<Arc<dyn Locker>, LockError> + Send + Sync>;

/// Registry of locker backends keyed by name
pub struct LockerRegistry {
    factories: HashMap<String, LockerFactory>,
}

impl Default for LockerRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(MEMORY_LOCKER, |_config: &str| {
            Ok(Arc::new(InMemoryLocker::new()) as Arc<dyn Locker>)
        });
        registry
    }
}

impl LockerRegistry {
    /// Create a registry with the built-in backends
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry without any backends
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a backend
    ///
    /// # Panics
    ///
    /// Panics if `name` is already registered.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&str) -> Result<Arc<dyn Locker>, LockError> + Send + Sync + 'static,
    {
        if self.factories.contains_key(name) {
            panic!("locker backend registered twice: {}", name);
        }
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    /// Check if a backend is registered
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Build the named backend
    pub fn create(&self, name: &str, config: &str) -> Result<Arc<dyn Locker>, LockError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| LockError::UnknownBackend(name.to_string()))?;
        factory(config)
    }

    /// Get all registered backend names
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(|s| s.as_str())
    }
}

impl fmt::Debug for LockerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockerRegistry")
            .field("backends", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_builder() {
        let options = LockOptions::new()
            .with_max_attempts(3)
            .with_expiration(Duration::from_secs(5));

        assert_eq!(options.max_attempts, 3);
        assert_eq!(options.expiration, Some(Duration::from_secs(5)));
        assert!(!options.attempts_exhausted(2));
        assert!(options.attempts_exhausted(3));
        assert!(!LockOptions::default().attempts_exhausted(1000));
    }

    #[test]
    fn test_user_file_lock_key() {
        assert_eq!(user_file_lock_key(1), "user-1-file");
    }

    #[test]
    fn test_tokens_are_unique() {
        assert_ne!(LockToken::generate(), LockToken::generate());
    }

    #[test]
    fn test_registry_default_backend() {
        let registry = LockerRegistry::new();
        assert!(registry.contains(MEMORY_LOCKER));
        assert!(registry.create(MEMORY_LOCKER, "").is_ok());
        assert!(format!("{:?}", registry).contains("memory"));
    }

    #[test]
    fn test_registry_unknown_backend() {
        let registry = LockerRegistry::new();
        let result = registry.create("redis", "");
        assert!(matches!(result, Err(LockError::UnknownBackend(name)) if name == "redis"));
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn test_registry_duplicate_panics() {
        let mut registry = LockerRegistry::new();
        registry.register(MEMORY_LOCKER, |_config: &str| {
            Ok(Arc::new(InMemoryLocker::new()) as Arc<dyn Locker>)
        });
    }

    #[tokio::test]
    async fn test_with_lock_releases_key() {
        let locker = InMemoryLocker::new();
        let cancel = CancellationToken::new();

        let value: Result<u32, LockError> =
            with_lock(&locker, &cancel, "k", LockOptions::default(), async {
                assert!(locker.is_locked("k"));
                Ok(7)
            })
            .await;

        assert_eq!(value, Ok(7));
        assert!(!locker.is_locked("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_lock_releases_abandoned_work() {
        let locker = InMemoryLocker::new();
        let cancel = CancellationToken::new();

        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            with_lock(&locker, &cancel, "k", LockOptions::default(), async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok::<_, LockError>(())
            }),
        )
        .await;
        assert!(abandoned.is_err());
        assert!(!locker.is_locked("k"));

        let token = locker
            .lock(&cancel, "k", LockOptions::new().with_max_attempts(1))
            .await
            .unwrap();
        locker.unlock(&cancel, "k", &token).await.unwrap();
    }

    #[tokio::test]
    async fn test_with_lock_releases_after_panic() {
        use futures::FutureExt;

        let locker = InMemoryLocker::new();
        let cancel = CancellationToken::new();

        let work = with_lock(&locker, &cancel, "k", LockOptions::default(), async {
            if locker.is_locked("k") {
                panic!("mutation failed");
            }
            Ok::<_, LockError>(())
        });
        let outcome = std::panic::AssertUnwindSafe(work).catch_unwind().await;
        assert!(outcome.is_err());
        assert!(!locker.is_locked("k"));
    }

    #[tokio::test]
    async fn test_with_lock_propagates_contention() {
        let locker = InMemoryLocker::new();
        let cancel = CancellationToken::new();
        let _held = locker.lock(&cancel, "k", LockOptions::default()).await.unwrap();

        let result: Result<(), LockError> = with_lock(
            &locker,
            &cancel,
            "k",
            LockOptions::new().with_max_attempts(1),
            async { Ok(()) },
        )
        .await;

        assert_eq!(result, Err(LockError::MaxAttempts));
    }
}
