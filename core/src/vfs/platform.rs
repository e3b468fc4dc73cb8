//! Named advisory mutexes shared by every context that opens the same files.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug, Error)]
pub enum PlatformLockError {
    #[error("timed out waiting for {0}")]
    TimedOut(String),
    #[error("lock {0} is unavailable: {1}")]
    Unavailable(String, String),
}

/// Proof of holding a named lock. Dropping it releases the lock.
pub struct HeldLock {
    name: String,
    mode: LockMode,
    _release: Box<dyn Send + Sync>,
}

impl HeldLock {
    pub fn new(name: impl Into<String>, mode: LockMode, release: impl Send + Sync + 'static) -> Self {
        Self { name: name.into(), mode, _release: Box::new(release) }
    }

    pub fn name(&self) -> &str { &self.name }
    pub fn mode(&self) -> LockMode { self.mode }
}

impl std::fmt::Debug for HeldLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "HeldLock({} {:?})", self.name, self.mode) }
}

/// The platform mutex primitive underneath [`super::LockManager`].
#[async_trait]
pub trait LockProvider: Send + Sync + 'static {
    /// Wait for the named lock, giving up after `timeout`.
    async fn acquire(&self, name: &str, mode: LockMode, timeout: Option<Duration>) -> Result<HeldLock, PlatformLockError>;

    /// Take the named lock only if that doesn't require waiting.
    fn try_acquire(&self, name: &str, mode: LockMode) -> Option<HeldLock>;

    /// Whether the named lock is currently held exclusively by anyone.
    fn held_exclusively(&self, name: &str) -> bool;
}

/// In-process named locks, for contexts living in one process.
#[derive(Default)]
pub struct LocalLockProvider {
    locks: DashMap<String, Arc<NamedLock>>,
}

#[derive(Default)]
struct NamedLock {
    lock: Arc<RwLock<()>>,
    exclusive: Arc<AtomicUsize>,
}

struct ExclusiveRelease {
    _guard: tokio::sync::OwnedRwLockWriteGuard<()>,
    exclusive: Arc<AtomicUsize>,
}

impl Drop for ExclusiveRelease {
    fn drop(&mut self) { self.exclusive.fetch_sub(1, Ordering::SeqCst); }
}

impl LocalLockProvider {
    pub fn new() -> Self { Self::default() }

    fn named(&self, name: &str) -> Arc<NamedLock> { self.locks.entry(name.to_owned()).or_default().clone() }

    fn exclusive(name: &str, lock: &NamedLock, guard: tokio::sync::OwnedRwLockWriteGuard<()>) -> HeldLock {
        lock.exclusive.fetch_add(1, Ordering::SeqCst);
        HeldLock::new(name, LockMode::Exclusive, ExclusiveRelease { _guard: guard, exclusive: lock.exclusive.clone() })
    }
}

#[async_trait]
impl LockProvider for LocalLockProvider {
    async fn acquire(&self, name: &str, mode: LockMode, timeout: Option<Duration>) -> Result<HeldLock, PlatformLockError> {
        let named = self.named(name);
        let wait = async {
            match mode {
                LockMode::Shared => HeldLock::new(name, mode, named.lock.clone().read_owned().await),
                LockMode::Exclusive => {
                    let guard = named.lock.clone().write_owned().await;
                    Self::exclusive(name, &named, guard)
                }
            }
        };
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, wait).await.map_err(|_| PlatformLockError::TimedOut(name.to_owned())),
            None => Ok(wait.await),
        }
    }

    fn try_acquire(&self, name: &str, mode: LockMode) -> Option<HeldLock> {
        let named = self.named(name);
        match mode {
            LockMode::Shared => named.lock.clone().try_read_owned().ok().map(|guard| HeldLock::new(name, mode, guard)),
            LockMode::Exclusive => named.lock.clone().try_write_owned().ok().map(|guard| Self::exclusive(name, &named, guard)),
        }
    }

    fn held_exclusively(&self, name: &str) -> bool {
        self.locks.get(name).is_some_and(|named| named.exclusive.load(Ordering::SeqCst) > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exclusive_excludes_everyone() {
        let locks = LocalLockProvider::new();
        let held = locks.acquire("f", LockMode::Exclusive, None).await.unwrap();
        assert!(locks.held_exclusively("f"));
        assert!(locks.try_acquire("f", LockMode::Shared).is_none());
        assert!(matches!(
            locks.acquire("f", LockMode::Shared, Some(Duration::from_millis(10))).await,
            Err(PlatformLockError::TimedOut(_))
        ));
        drop(held);
        assert!(!locks.held_exclusively("f"));
        assert!(locks.try_acquire("f", LockMode::Shared).is_some());
    }

    #[tokio::test]
    async fn shared_holders_coexist() {
        let locks = LocalLockProvider::new();
        let a = locks.acquire("f", LockMode::Shared, None).await.unwrap();
        let b = locks.try_acquire("f", LockMode::Shared).unwrap();
        assert!(locks.try_acquire("f", LockMode::Exclusive).is_none());
        assert!(!locks.held_exclusively("f"));
        drop((a, b));
        assert!(locks.try_acquire("f", LockMode::Exclusive).is_some());
    }
}
