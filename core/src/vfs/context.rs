use std::future::Future;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::Durability;
use crate::error::StorageError;
use crate::storage::{StorageEngine, StorageTransaction, TransactionMode};

/// Owns the transaction lease of one VFS instance against the backing store.
///
/// Every store access goes through [`StoreContext::run`], which takes the lease mailbox (a fair
/// FIFO lock) for the whole run. Runs therefore execute one at a time in arrival order and a
/// lease is never begun, committed or abandoned by two callers at once. The lease is reused
/// across runs until it is completed, so a burst of requests shares one store transaction.
pub struct StoreContext {
    name: String,
    engine: Arc<dyn StorageEngine>,
    durability: Durability,
    lease: tokio::sync::Mutex<Lease>,
}

#[derive(Default)]
struct Lease {
    tx: Option<Arc<dyn StorageTransaction>>,
    generation: u64,
}

impl StoreContext {
    pub fn new(name: impl Into<String>, engine: Arc<dyn StorageEngine>, durability: Durability) -> Self {
        Self { name: name.into(), engine, durability, lease: tokio::sync::Mutex::new(Lease::default()) }
    }

    pub fn name(&self) -> &str { &self.name }
    pub fn engine(&self) -> &Arc<dyn StorageEngine> { &self.engine }
    pub fn durability(&self) -> Durability { self.durability }

    /// Run `f` against the live lease, opening one if needed. A read-write run upgrades a read-only lease.
    ///
    /// If the store reports the lease inactive (it expired while idle), `f` is retried exactly once on a
    /// fresh lease. Any other error aborts the lease and is returned unchanged.
    pub async fn run<T, F, Fut>(&self, mode: TransactionMode, f: F) -> Result<T, StorageError>
    where
        F: Fn(Arc<dyn StorageTransaction>) -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let mut lease = self.lease.lock().await;
        let mut retried = false;
        loop {
            let tx = self.checkout(&mut lease, mode).await?;
            match f(tx.clone()).await {
                Ok(value) => return Ok(value),
                Err(StorageError::TransactionInactive) if !retried => {
                    warn!("{}: lease {} went inactive, retrying on a new one", self.name, lease.generation);
                    lease.tx = None;
                    retried = true;
                }
                Err(err) => {
                    tx.abort();
                    lease.tx = None;
                    return Err(err);
                }
            }
        }
    }

    async fn checkout(&self, lease: &mut Lease, mode: TransactionMode) -> Result<Arc<dyn StorageTransaction>, StorageError> {
        if let Some(tx) = &lease.tx {
            let upgrade = mode == TransactionMode::ReadWrite && tx.mode() == TransactionMode::ReadOnly;
            if tx.is_active() && !upgrade {
                return Ok(tx.clone());
            }
            if upgrade && tx.is_active() {
                // a read-only lease has nothing to lose
                if let Err(err) = tx.commit().await {
                    debug!("{}: finishing read-only lease failed: {}", self.name, err);
                }
            }
        }
        let tx = self.engine.begin(mode).await?;
        lease.generation += 1;
        debug!("{}: lease {} begin {}", self.name, lease.generation, mode);
        lease.tx = Some(tx.clone());
        Ok(tx)
    }

    /// Commit the current lease, if any. Everything written so far becomes visible to other contexts.
    pub async fn complete(&self) -> Result<(), StorageError> {
        let mut lease = self.lease.lock().await;
        let Some(tx) = lease.tx.take() else { return Ok(()) };
        if !tx.is_active() {
            return Ok(());
        }
        debug!("{}: lease {} commit", self.name, lease.generation);
        match tx.commit().await {
            // an expired lease already published its writes
            Err(StorageError::TransactionInactive) => Ok(()),
            other => other,
        }
    }

    /// Complete the lease and, unless durability is relaxed, flush the store.
    pub async fn sync(&self) -> Result<(), StorageError> {
        self.complete().await?;
        if self.durability != Durability::Relaxed {
            self.engine.flush().await?;
        }
        Ok(())
    }

    /// Flush after an atomic commit when durability is strict.
    pub async fn commit_barrier(&self) -> Result<(), StorageError> {
        if self.durability == Durability::Strict {
            self.engine.flush().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::storage::MemoryStorageEngine;

    #[tokio::test]
    async fn runs_share_a_lease_until_completed() -> Result<(), StorageError> {
        let engine = MemoryStorageEngine::new();
        let ctx = StoreContext::new("test", Arc::new(engine.clone()), Durability::Default);

        ctx.run(TransactionMode::ReadWrite, |tx| async move { tx.put(b"a", b"1").await }).await?;
        let seen = ctx.run(TransactionMode::ReadOnly, |tx| async move { tx.get(b"a").await }).await?;
        assert_eq!(seen, Some(b"1".to_vec()));
        assert!(engine.is_empty());

        ctx.sync().await?;
        assert_eq!(engine.len(), 1);
        assert_eq!(engine.flush_count(), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn retries_once_when_the_lease_expired() -> Result<(), StorageError> {
        let engine = MemoryStorageEngine::with_lease_expiry(Duration::from_millis(10));
        let ctx = StoreContext::new("test", Arc::new(engine.clone()), Durability::Relaxed);
        ctx.run(TransactionMode::ReadWrite, |tx| async move { tx.put(b"a", b"1").await }).await?;

        tokio::time::sleep(Duration::from_millis(50)).await;
        let attempts = AtomicUsize::new(0);
        let attempts = &attempts;
        ctx.run(TransactionMode::ReadWrite, |tx| async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            tx.put(b"b", b"2").await
        })
        .await?;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);

        ctx.sync().await?;
        assert_eq!(engine.keys(), vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(engine.flush_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn other_errors_abort_the_lease() -> Result<(), StorageError> {
        let engine = MemoryStorageEngine::new();
        let ctx = StoreContext::new("test", Arc::new(engine.clone()), Durability::Default);
        let result: Result<(), _> = ctx
            .run(TransactionMode::ReadWrite, |tx| async move {
                tx.put(b"a", b"1").await?;
                Err(StorageError::InvalidKey("boom".into()))
            })
            .await;
        assert!(result.is_err());
        ctx.sync().await?;
        assert!(engine.is_empty());
        Ok(())
    }
}
