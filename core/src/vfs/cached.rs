use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::host::VfsHost;
use super::lock::{LockManager, LockSettings, LockState};
use super::page::{Page, Superblock};
use super::page_store::PageStore;
use super::{DeviceCharacteristics, FileControl, OpenFlags, ReadOutcome, StoreContext, SyncFlags, VfsFile};
use crate::config::VfsOptions;
use crate::error::{StorageError, VfsError};

/// Pages of a cached-writes file all live at this version.
const VERSION: u64 = 0;

/// A file that keeps one unversioned copy of each page. Writes made while EXCLUSIVE are cached and
/// stored together when the lock drops, so a failure part way through can leave a torn file.
pub struct CachedWritesFile {
    path: String,
    flags: OpenFlags,
    store: PageStore,
    locks: LockManager,
    state: tokio::sync::Mutex<CacheState>,
}

#[derive(Default)]
struct CacheState {
    file_size: u64,
    cache: BTreeMap<u64, Vec<u8>>,
    truncated_to: Option<u64>,
}

impl CachedWritesFile {
    pub async fn open(ctx: Arc<StoreContext>, host: Arc<VfsHost>, path: &str, flags: OpenFlags, options: &VfsOptions) -> Result<Self, VfsError> {
        let store = PageStore::new(ctx.clone(), path)?;
        if !store.exists().await? {
            if !flags.contains(OpenFlags::CREATE) {
                return Err(VfsError::CantOpen(path.to_owned()));
            }
            store.write_superblock(&Superblock::default()).await?;
            ctx.complete().await?;
        }
        let file_size = store.last_page().await?.map_or(0, |page| page.end());
        let settings = LockSettings { policy: options.lock_policy, timeout: options.lock_timeout, max_retry: options.max_retry };
        Ok(Self {
            path: path.to_owned(),
            flags,
            store,
            locks: LockManager::new(path, host.locks().clone(), settings),
            state: tokio::sync::Mutex::new(CacheState { file_size, ..Default::default() }),
        })
    }

    async fn caching(&self) -> bool { self.locks.state().await >= LockState::Exclusive }

    /// Store the cached writes in one lease and publish it.
    async fn flush(&self, state: &mut CacheState) -> Result<(), VfsError> {
        if state.cache.is_empty() && state.truncated_to.is_none() {
            return Ok(());
        }
        if let Some(size) = state.truncated_to.take() {
            self.store.truncate(&Superblock { file_size: size, ..Default::default() }).await?;
        }
        let pages: Vec<Page> = std::mem::take(&mut state.cache).into_iter().map(|(offset, data)| Page::new(offset, VERSION, data)).collect();
        debug!("{}: flushing {} cached pages", self.path, pages.len());
        self.store.write_pages(&pages).await?;
        self.store.context().sync().await?;
        Ok(())
    }
}

#[async_trait]
impl VfsFile for CachedWritesFile {
    fn path(&self) -> &str { &self.path }

    async fn read(&self, buf: &mut [u8], offset: u64) -> Result<ReadOutcome, VfsError> {
        let state = self.state.lock().await;
        let view = Superblock { file_size: state.file_size, version: VERSION, data: Vec::new() };
        Ok(self.store.read_with(&view, offset, buf, &state.cache).await?)
    }

    async fn write(&self, data: &[u8], offset: u64) -> Result<(), VfsError> {
        if self.flags.contains(OpenFlags::READONLY) {
            return Err(StorageError::ReadOnly.into());
        }
        let caching = self.caching().await;
        let mut state = self.state.lock().await;
        state.file_size = state.file_size.max(offset + data.len() as u64);
        if caching {
            let end = offset + data.len() as u64;
            let covered: Vec<u64> = state.cache.range(offset + 1..end).filter(|&(&start, old)| start + old.len() as u64 <= end).map(|(&start, _)| start).collect();
            for start in covered {
                state.cache.remove(&start);
            }
            state.cache.insert(offset, data.to_vec());
        } else {
            self.store.write_page(&Page::new(offset, VERSION, data.to_vec())).await?;
        }
        Ok(())
    }

    async fn truncate(&self, size: u64) -> Result<(), VfsError> {
        let caching = self.caching().await;
        let mut state = self.state.lock().await;
        state.file_size = size;
        if caching {
            state.cache.retain(|&offset, _| offset < size);
            state.truncated_to = Some(state.truncated_to.map_or(size, |t| t.min(size)));
        } else {
            self.store.truncate(&Superblock { file_size: size, ..Default::default() }).await?;
        }
        Ok(())
    }

    async fn sync(&self, _flags: SyncFlags) -> Result<(), VfsError> {
        if !self.caching().await {
            self.store.context().sync().await?;
        }
        Ok(())
    }

    async fn file_size(&self) -> Result<u64, VfsError> { Ok(self.state.lock().await.file_size) }

    async fn lock(&self, level: LockState) -> Result<(), VfsError> {
        let before = self.locks.state().await;
        let result = self.locks.lock(level).await;
        if before == LockState::None && self.locks.state().await >= LockState::Shared {
            let file_size = self.store.last_page().await?.map_or(0, |page| page.end());
            self.state.lock().await.file_size = file_size;
        }
        result.map(|_| ())
    }

    async fn unlock(&self, level: LockState) -> Result<(), VfsError> {
        if level < LockState::Exclusive && self.caching().await {
            let mut state = self.state.lock().await;
            self.flush(&mut state).await?;
        }
        self.locks.unlock(level).await?;
        Ok(())
    }

    async fn check_reserved_lock(&self) -> Result<bool, VfsError> { Ok(self.locks.check_reserved()) }

    fn device_characteristics(&self) -> DeviceCharacteristics {
        DeviceCharacteristics::SAFE_APPEND | DeviceCharacteristics::SEQUENTIAL | DeviceCharacteristics::UNDELETABLE_WHEN_OPEN
    }

    async fn file_control(&self, op: FileControl) -> Result<(), VfsError> {
        match op {
            FileControl::Sync => Ok(()),
            _ => Err(VfsError::NotFound),
        }
    }

    async fn close(&self) -> Result<(), VfsError> {
        {
            let mut state = self.state.lock().await;
            self.flush(&mut state).await?;
        }
        self.locks.unlock(LockState::None).await?;
        if self.flags.contains(OpenFlags::DELETE_ON_CLOSE) {
            self.store.delete_file().await?;
        }
        self.store.context().complete().await?;
        Ok(())
    }
}
