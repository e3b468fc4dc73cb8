use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};
use ulid::Ulid;

use super::atomic::{AtomicWriteCoordinator, FileState};
use super::host::VfsHost;
use super::lock::{LockManager, LockSettings, LockState};
use super::page::Superblock;
use super::page_store::PageStore;
use super::{DeviceCharacteristics, FileControl, OpenFlags, ReadOutcome, StoreContext, SyncFlags, VfsFile};
use crate::config::VfsOptions;
use crate::error::{StorageError, VfsError};

/// A file whose commits are published atomically through versioned pages and a single superblock write.
pub struct BatchAtomicFile {
    id: Ulid,
    path: String,
    flags: OpenFlags,
    locks: LockManager,
    coordinator: AtomicWriteCoordinator,
    host: Arc<VfsHost>,
    state: tokio::sync::Mutex<FileState>,
}

impl BatchAtomicFile {
    pub async fn open(ctx: Arc<StoreContext>, host: Arc<VfsHost>, path: &str, flags: OpenFlags, options: &VfsOptions) -> Result<Self, VfsError> {
        let store = PageStore::new(ctx.clone(), path)?;
        let superblock = match store.read_superblock().await? {
            Some(superblock) => superblock,
            None if flags.contains(OpenFlags::CREATE) => {
                let superblock = Superblock::default();
                store.write_superblock(&superblock).await?;
                ctx.complete().await?;
                debug!("{}: created {}", ctx.name(), path);
                superblock
            }
            None => return Err(VfsError::CantOpen(path.to_owned())),
        };

        let id = Ulid::new();
        let settings = LockSettings { policy: options.lock_policy, timeout: options.lock_timeout, max_retry: options.max_retry };
        Ok(Self {
            id,
            path: path.to_owned(),
            flags,
            locks: LockManager::new(path, host.locks().clone(), settings),
            coordinator: AtomicWriteCoordinator::new(store, host.clone(), id, options.purge, options.purge_at_least),
            host,
            state: tokio::sync::Mutex::new(FileState::new(superblock)),
        })
    }

    pub fn id(&self) -> Ulid { self.id }

    /// Pick up commits made by other contexts since this handle last looked, unless local writes
    /// are still unpublished.
    async fn refresh(&self) -> Result<(), VfsError> {
        let mut state = self.state.lock().await;
        if !state.in_batch() && state.pending.is_empty() && !state.dirty {
            if let Some(superblock) = self.coordinator.store().read_superblock().await? {
                state.superblock = superblock;
            }
        }
        self.host.snapshots().register(&self.path, self.id, state.superblock.version);
        Ok(())
    }

    fn writable(&self) -> Result<(), VfsError> {
        if self.flags.contains(OpenFlags::READONLY) {
            return Err(StorageError::ReadOnly.into());
        }
        Ok(())
    }
}

#[async_trait]
impl VfsFile for BatchAtomicFile {
    fn path(&self) -> &str { &self.path }

    async fn read(&self, buf: &mut [u8], offset: u64) -> Result<ReadOutcome, VfsError> {
        let state = self.state.lock().await;
        let available = state.superblock.file_size.saturating_sub(offset).min(buf.len() as u64) as usize;
        let (head, tail) = buf.split_at_mut(available);
        tail.fill(0);
        match self.coordinator.store().read_with(&state.superblock, offset, head, &state.pending).await? {
            ReadOutcome::Complete if available == buf.len() => Ok(ReadOutcome::Complete),
            ReadOutcome::Complete => Ok(ReadOutcome::Short { filled: available }),
            short => Ok(short),
        }
    }

    async fn write(&self, data: &[u8], offset: u64) -> Result<(), VfsError> {
        self.writable()?;
        let mut state = self.state.lock().await;
        self.coordinator.write(&mut state, offset, data);
        Ok(())
    }

    async fn truncate(&self, size: u64) -> Result<(), VfsError> {
        self.writable()?;
        let mut state = self.state.lock().await;
        self.coordinator.truncate(&mut state, size).await
    }

    async fn sync(&self, flags: SyncFlags) -> Result<(), VfsError> {
        debug!("{}: sync {:?}", self.path, flags);
        let mut state = self.state.lock().await;
        self.coordinator.sync(&mut state).await
    }

    async fn file_size(&self) -> Result<u64, VfsError> { Ok(self.state.lock().await.superblock.file_size) }

    async fn lock(&self, level: LockState) -> Result<(), VfsError> {
        let before = self.locks.state().await;
        let result = self.locks.lock(level).await;
        if before == LockState::None && self.locks.state().await >= LockState::Shared {
            self.refresh().await?;
        }
        result.map(|_| ())
    }

    async fn unlock(&self, level: LockState) -> Result<(), VfsError> {
        self.locks.unlock(level).await?;
        if level == LockState::None {
            self.host.snapshots().release(&self.path, self.id);
        }
        Ok(())
    }

    async fn check_reserved_lock(&self) -> Result<bool, VfsError> { Ok(self.locks.check_reserved()) }

    fn device_characteristics(&self) -> DeviceCharacteristics {
        DeviceCharacteristics::BATCH_ATOMIC | DeviceCharacteristics::SAFE_APPEND | DeviceCharacteristics::SEQUENTIAL | DeviceCharacteristics::UNDELETABLE_WHEN_OPEN
    }

    async fn file_control(&self, op: FileControl) -> Result<(), VfsError> {
        let mut state = self.state.lock().await;
        match op {
            FileControl::Overwrite => state.overwrite = true,
            FileControl::Sync => self.coordinator.sync(&mut state).await?,
            FileControl::CommitPhaseTwo => state.overwrite = false,
            FileControl::BeginAtomicWrite => self.coordinator.begin(&mut state).await?,
            FileControl::CommitAtomicWrite => self.coordinator.commit(&mut state).await?,
            FileControl::RollbackAtomicWrite => self.coordinator.rollback(&mut state),
            FileControl::Other(_) => return Err(VfsError::NotFound),
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), VfsError> {
        {
            let mut state = self.state.lock().await;
            if state.in_batch() {
                warn!("{}: closed during an atomic write, rolling back", self.path);
                self.coordinator.rollback(&mut state);
            }
            self.coordinator.flush(&mut state).await?;
        }
        self.locks.unlock(LockState::None).await?;
        self.host.snapshots().release(&self.path, self.id);

        let store = self.coordinator.store();
        if self.flags.contains(OpenFlags::DELETE_ON_CLOSE) {
            store.delete_file().await?;
        }
        store.context().complete().await?;
        Ok(())
    }
}
