use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sled::{Batch, Config, Db, Tree};
use strata_core::error::StorageError;
use strata_core::storage::{Entry, KeyRange, StorageEngine, StorageTransaction, TransactionMode, WriteSet};
use tokio::task;
use tracing::debug;

use crate::error::{sled_error, SledError};

const PAGES_TREE: &str = "pages";

/// Page storage in a sled tree.
///
/// Sled has no long-lived transactions, so a read-write transaction keeps its writes in memory and
/// applies them as one atomic batch on commit. Reads see committed data plus the transaction's own
/// writes.
pub struct SledStorageEngine {
    pub db: Db,
    tree: Tree,
}

impl SledStorageEngine {
    pub fn with_homedir_folder(folder_name: &str) -> anyhow::Result<Self> {
        let dir = dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Failed to get home directory"))?.join(folder_name);

        Self::with_path(dir)
    }

    pub fn with_path(path: PathBuf) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&path)?;
        let db = sled::open(path.join("sled"))?;
        Self::open(db)
    }

    pub fn new() -> anyhow::Result<Self> { Self::with_homedir_folder(".strata") }

    pub fn new_test() -> anyhow::Result<Self> { Self::open(Config::new().temporary(true).flush_every_ms(None).open()?) }

    fn open(db: Db) -> anyhow::Result<Self> {
        let tree = db.open_tree(PAGES_TREE)?;
        Ok(Self { db, tree })
    }
}

#[async_trait]
impl StorageEngine for SledStorageEngine {
    async fn begin(&self, mode: TransactionMode) -> Result<Arc<dyn StorageTransaction>, StorageError> {
        Ok(Arc::new(SledTransaction { tree: self.tree.clone(), mode, active: AtomicBool::new(true), writes: Mutex::new(WriteSet::new()) }))
    }

    async fn flush(&self) -> Result<(), StorageError> {
        let db = self.db.clone();
        // Use spawn_blocking since sled operations are not async
        let flushed = task::spawn_blocking(move || db.flush()).await.map_err(SledError::from)?.map_err(sled_error)?;
        debug!("flushed {} bytes", flushed);
        Ok(())
    }
}

struct SledTransaction {
    tree: Tree,
    mode: TransactionMode,
    active: AtomicBool,
    writes: Mutex<WriteSet>,
}

impl SledTransaction {
    fn check_active(&self) -> Result<(), StorageError> {
        if !self.active.load(Ordering::SeqCst) {
            return Err(StorageError::TransactionInactive);
        }
        Ok(())
    }

    fn writes(&self) -> Result<std::sync::MutexGuard<'_, WriteSet>, StorageError> {
        if self.mode == TransactionMode::ReadOnly {
            return Err(StorageError::ReadOnly);
        }
        self.check_active()?;
        Ok(self.writes.lock().expect("Failed to lock the write set"))
    }
}

#[async_trait]
impl StorageTransaction for SledTransaction {
    fn mode(&self) -> TransactionMode { self.mode }

    fn is_active(&self) -> bool { self.active.load(Ordering::SeqCst) }

    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        self.check_active()?;
        if let Some(written) = self.writes.lock().expect("Failed to lock the write set").get(key) {
            return Ok(written.map(|value| value.to_vec()));
        }
        let tree = self.tree.clone();
        let key = key.to_vec();
        let value = task::spawn_blocking(move || tree.get(key)).await.map_err(SledError::from)?.map_err(sled_error)?;
        Ok(value.map(|ivec| ivec.to_vec()))
    }

    async fn scan(&self, range: &KeyRange, limit: Option<usize>) -> Result<Vec<Entry>, StorageError> {
        self.check_active()?;
        // deletions in the write set may hide committed entries, so fetch enough to still fill the limit
        let (extra, empty) = {
            let writes = self.writes.lock().expect("Failed to lock the write set");
            (writes.deletions_in(range), writes.is_empty())
        };
        let fetch = limit.map(|limit| limit + extra);

        let tree = self.tree.clone();
        let bounds = (range.start.clone(), range.end.clone());
        let committed = task::spawn_blocking(move || -> Result<Vec<Entry>, sled::Error> {
            let iter = tree.range::<Vec<u8>, _>(bounds).map(|entry| entry.map(|(k, v)| (k.to_vec(), v.to_vec())));
            match fetch {
                Some(n) => iter.take(n).collect(),
                None => iter.collect(),
            }
        })
        .await
        .map_err(SledError::from)?
        .map_err(sled_error)?;

        if empty {
            return Ok(committed);
        }
        Ok(self.writes.lock().expect("Failed to lock the write set").overlay(committed, range, limit))
    }

    async fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.writes()?.put(key, value);
        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> Result<(), StorageError> {
        self.writes()?.delete(key);
        Ok(())
    }

    async fn commit(&self) -> Result<(), StorageError> {
        if !self.active.swap(false, Ordering::SeqCst) {
            return Err(StorageError::TransactionInactive);
        }
        let mut batch = Batch::default();
        let mut count = 0;
        for (key, value) in self.writes.lock().expect("Failed to lock the write set").drain() {
            match value {
                Some(value) => batch.insert(key, value),
                None => batch.remove(key),
            }
            count += 1;
        }
        if count == 0 {
            return Ok(());
        }
        let tree = self.tree.clone();
        task::spawn_blocking(move || tree.apply_batch(batch)).await.map_err(SledError::from)?.map_err(sled_error)?;
        debug!("committed {} writes", count);
        Ok(())
    }

    fn abort(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            self.writes.lock().expect("Failed to lock the write set").clear();
        }
    }
}
