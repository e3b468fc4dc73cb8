use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{Entry, KeyRange, StorageEngine, StorageTransaction, TransactionMode, WriteSet};
use crate::error::StorageError;

/// An ordered in-memory store.
///
/// Besides being the default store for tests, it can imitate the two behaviors of real stores
/// that the upper layers must survive: transactions that expire when left idle (see
/// [`MemoryStorageEngine::with_lease_expiry`]) and commits that fail (see
/// [`MemoryStorageEngine::fail_next_commits`]).
#[derive(Clone, Default)]
pub struct MemoryStorageEngine(Arc<Inner>);

#[derive(Default)]
struct Inner {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    lease_expiry: Option<Duration>,
    failing_commits: AtomicUsize,
    commits: AtomicU64,
    flushes: AtomicU64,
}

impl MemoryStorageEngine {
    pub fn new() -> Self { Self::default() }

    /// Transactions left idle for longer than `expiry` commit on their own, after which any use reports
    /// [`StorageError::TransactionInactive`].
    pub fn with_lease_expiry(expiry: Duration) -> Self { Self(Arc::new(Inner { lease_expiry: Some(expiry), ..Default::default() })) }

    /// Make the next `n` commits fail and discard their writes.
    pub fn fail_next_commits(&self, n: usize) { self.0.failing_commits.store(n, Ordering::SeqCst) }

    pub fn commit_count(&self) -> u64 { self.0.commits.load(Ordering::SeqCst) }
    pub fn flush_count(&self) -> u64 { self.0.flushes.load(Ordering::SeqCst) }

    /// Committed keys, in order
    pub fn keys(&self) -> Vec<Vec<u8>> { self.0.data.read().expect("Failed to lock the store").keys().cloned().collect() }

    pub fn len(&self) -> usize { self.0.data.read().expect("Failed to lock the store").len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

#[async_trait]
impl StorageEngine for MemoryStorageEngine {
    async fn begin(&self, mode: TransactionMode) -> Result<Arc<dyn StorageTransaction>, StorageError> {
        Ok(Arc::new(MemoryTransaction {
            inner: self.0.clone(),
            mode,
            active: AtomicBool::new(true),
            state: Mutex::new(TxState { writes: WriteSet::new(), last_used: Instant::now() }),
        }))
    }

    async fn flush(&self) -> Result<(), StorageError> {
        self.0.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryTransaction {
    inner: Arc<Inner>,
    mode: TransactionMode,
    active: AtomicBool,
    state: Mutex<TxState>,
}

struct TxState {
    writes: WriteSet,
    last_used: Instant,
}

impl Inner {
    fn apply(&self, writes: &mut WriteSet) {
        let mut data = self.data.write().expect("Failed to lock the store");
        for (key, value) in writes.drain() {
            match value {
                Some(value) => data.insert(key, value),
                None => data.remove(&key),
            };
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
    }

    fn scan(&self, range: &KeyRange, limit: Option<usize>) -> Vec<Entry> {
        let data = self.data.read().expect("Failed to lock the store");
        let iter = data.range::<[u8], _>(range.as_bounds()).map(|(k, v)| (k.clone(), v.clone()));
        match limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        }
    }
}

impl MemoryTransaction {
    /// Checks the lease is still alive and marks it used. An expired lease publishes what it has, like
    /// a store that auto-commits idle transactions.
    fn touch(&self) -> Result<std::sync::MutexGuard<'_, TxState>, StorageError> {
        let mut state = self.state.lock().expect("Failed to lock the transaction");
        if !self.active.load(Ordering::SeqCst) {
            return Err(StorageError::TransactionInactive);
        }
        if let Some(expiry) = self.inner.lease_expiry {
            if state.last_used.elapsed() > expiry {
                self.active.store(false, Ordering::SeqCst);
                if !state.writes.is_empty() {
                    self.inner.apply(&mut state.writes);
                }
                return Err(StorageError::TransactionInactive);
            }
        }
        state.last_used = Instant::now();
        Ok(state)
    }

    fn writable(&self) -> Result<std::sync::MutexGuard<'_, TxState>, StorageError> {
        if self.mode == TransactionMode::ReadOnly {
            return Err(StorageError::ReadOnly);
        }
        self.touch()
    }
}

#[async_trait]
impl StorageTransaction for MemoryTransaction {
    fn mode(&self) -> TransactionMode { self.mode }

    fn is_active(&self) -> bool { self.active.load(Ordering::SeqCst) }

    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let state = self.touch()?;
        if let Some(written) = state.writes.get(key) {
            return Ok(written.map(|v| v.to_vec()));
        }
        Ok(self.inner.data.read().expect("Failed to lock the store").get(key).cloned())
    }

    async fn scan(&self, range: &KeyRange, limit: Option<usize>) -> Result<Vec<Entry>, StorageError> {
        let state = self.touch()?;
        if state.writes.is_empty() {
            return Ok(self.inner.scan(range, limit));
        }
        let committed = self.inner.scan(range, limit.map(|l| l + state.writes.deletions_in(range)));
        Ok(state.writes.overlay(committed, range, limit))
    }

    async fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.writable()?.writes.put(key, value);
        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> Result<(), StorageError> {
        self.writable()?.writes.delete(key);
        Ok(())
    }

    async fn commit(&self) -> Result<(), StorageError> {
        let mut state = self.touch()?;
        self.active.store(false, Ordering::SeqCst);

        if self.mode == TransactionMode::ReadOnly {
            return Ok(());
        }
        let failing = self.inner.failing_commits.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            state.writes.clear();
            return Err(StorageError::BackendError("commit failed".into()));
        }
        self.inner.apply(&mut state.writes);
        Ok(())
    }

    fn abort(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            self.state.lock().expect("Failed to lock the transaction").writes.clear();
        }
    }
}
