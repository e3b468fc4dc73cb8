//! A virtual file system that keeps the page file of an embedded SQL engine inside a transactional
//! key-value store.
//!
//! Each file is a set of versioned pages plus a superblock. An atomic write span stores its pages
//! at a new version and publishes them by rewriting the superblock, so readers resolving pages
//! against an older superblock keep seeing a consistent file.

pub mod atomic;
pub mod cached;
pub mod context;
pub mod file;
pub mod host;
pub mod keys;
pub mod lock;
pub mod page;
pub mod page_store;
pub mod platform;

use std::sync::Arc;

use async_trait::async_trait;
use bitflags::bitflags;

pub use atomic::AtomicWriteCoordinator;
pub use cached::CachedWritesFile;
pub use context::StoreContext;
pub use file::BatchAtomicFile;
pub use host::{SnapshotRegistry, VfsHost};
pub use lock::{LockManager, LockState};
pub use page::{Page, PurgeRecord, Superblock};
pub use page_store::{PageStore, PurgeOutcome};
pub use platform::{LocalLockProvider, LockProvider};

use crate::config::{StorageMode, VfsOptions};
use crate::{action_debug, action_info};
use crate::error::VfsError;
use crate::storage::StorageEngine;
use crate::util::slotmap::{SlotKey, SlotMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Complete,
    /// The file ended after `filled` bytes. The rest of the buffer is zeroed.
    Short { filled: usize },
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: u32 {
        const READONLY = 0x0000_0001;
        const READWRITE = 0x0000_0002;
        const CREATE = 0x0000_0004;
        const DELETE_ON_CLOSE = 0x0000_0008;
        const EXCLUSIVE = 0x0000_0010;
        const MAIN_DB = 0x0000_0100;
        const TEMP_DB = 0x0000_0200;
        const TRANSIENT_DB = 0x0000_0400;
        const MAIN_JOURNAL = 0x0000_0800;
        const TEMP_JOURNAL = 0x0000_1000;
        const SUBJOURNAL = 0x0000_2000;
        const SUPER_JOURNAL = 0x0000_4000;
        const WAL = 0x0008_0000;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DeviceCharacteristics: u32 {
        const ATOMIC = 0x0000_0001;
        const SAFE_APPEND = 0x0000_0200;
        const SEQUENTIAL = 0x0000_0400;
        const UNDELETABLE_WHEN_OPEN = 0x0000_0800;
        const POWERSAFE_OVERWRITE = 0x0000_1000;
        const IMMUTABLE = 0x0000_2000;
        const BATCH_ATOMIC = 0x0000_4000;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SyncFlags: u32 {
        const NORMAL = 0x0000_0002;
        const FULL = 0x0000_0003;
        const DATAONLY = 0x0000_0010;
    }
}

/// File control opcodes the VFS reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileControl {
    Overwrite,
    Sync,
    CommitPhaseTwo,
    BeginAtomicWrite,
    CommitAtomicWrite,
    RollbackAtomicWrite,
    Other(i32),
}

impl FileControl {
    pub fn from_code(op: i32) -> Self {
        match op {
            11 => FileControl::Overwrite,
            21 => FileControl::Sync,
            22 => FileControl::CommitPhaseTwo,
            31 => FileControl::BeginAtomicWrite,
            32 => FileControl::CommitAtomicWrite,
            33 => FileControl::RollbackAtomicWrite,
            other => FileControl::Other(other),
        }
    }
}

/// The per-file half of the storage-backend contract.
#[async_trait]
pub trait VfsFile: Send + Sync {
    fn path(&self) -> &str;
    async fn read(&self, buf: &mut [u8], offset: u64) -> Result<ReadOutcome, VfsError>;
    async fn write(&self, data: &[u8], offset: u64) -> Result<(), VfsError>;
    async fn truncate(&self, size: u64) -> Result<(), VfsError>;
    async fn sync(&self, flags: SyncFlags) -> Result<(), VfsError>;
    async fn file_size(&self) -> Result<u64, VfsError>;
    async fn lock(&self, level: LockState) -> Result<(), VfsError>;
    async fn unlock(&self, level: LockState) -> Result<(), VfsError>;
    async fn check_reserved_lock(&self) -> Result<bool, VfsError>;
    fn sector_size(&self) -> u32 { 512 }
    fn device_characteristics(&self) -> DeviceCharacteristics;
    async fn file_control(&self, op: FileControl) -> Result<(), VfsError>;
    async fn close(&self) -> Result<(), VfsError>;
}

/// Opaque handle to an open file. Stale once the file is closed, even if the slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileHandle(SlotKey<Arc<dyn VfsFile>>);

/// One VFS instance: a store context plus the files opened through it.
pub struct Vfs {
    name: String,
    ctx: Arc<StoreContext>,
    host: Arc<VfsHost>,
    options: VfsOptions,
    files: SlotMap<Arc<dyn VfsFile>>,
}

impl Vfs {
    /// A VFS coordinating with every other VFS of the process.
    pub fn new(name: impl Into<String>, engine: Arc<dyn StorageEngine>, options: VfsOptions) -> Self {
        Self::with_host(name, engine, options, VfsHost::global())
    }

    pub fn with_host(name: impl Into<String>, engine: Arc<dyn StorageEngine>, options: VfsOptions, host: Arc<VfsHost>) -> Self {
        let name = name.into();
        let ctx = Arc::new(StoreContext::new(name.clone(), engine, options.durability));
        action_info!(name, "ready", "{:?} {:?}", options.mode, options.durability);
        Self { name, ctx, host, options, files: SlotMap::new() }
    }

    pub fn name(&self) -> &str { &self.name }
    pub fn options(&self) -> &VfsOptions { &self.options }
    pub fn context(&self) -> &Arc<StoreContext> { &self.ctx }
    pub fn host(&self) -> &Arc<VfsHost> { &self.host }

    /// Open `path`, creating it when `flags` has CREATE. Returns the handle and the flags in effect.
    pub async fn open(&self, path: &str, flags: OpenFlags) -> Result<(FileHandle, OpenFlags), VfsError> {
        let file: Arc<dyn VfsFile> = match self.options.mode {
            StorageMode::BatchAtomic => Arc::new(BatchAtomicFile::open(self.ctx.clone(), self.host.clone(), path, flags, &self.options).await?),
            StorageMode::CachedWrites => Arc::new(CachedWritesFile::open(self.ctx.clone(), self.host.clone(), path, flags, &self.options).await?),
        };
        let handle = FileHandle(self.files.insert(file));
        action_debug!(self.name, "open", "{} {:?} as {:?}", path, flags, handle);
        Ok((handle, flags))
    }

    pub fn file(&self, handle: FileHandle) -> Result<Arc<dyn VfsFile>, VfsError> { self.files.get(handle.0).ok_or(VfsError::BadHandle) }

    pub async fn close(&self, handle: FileHandle) -> Result<(), VfsError> {
        let file = self.files.remove(handle.0).ok_or(VfsError::BadHandle)?;
        action_debug!(self.name, "close", "{}", file.path());
        file.close().await
    }

    pub async fn delete(&self, path: &str, sync_dir: bool) -> Result<(), VfsError> {
        PageStore::new(self.ctx.clone(), path)?.delete_file().await?;
        if sync_dir {
            self.ctx.sync().await?;
        } else {
            self.ctx.complete().await?;
        }
        Ok(())
    }

    pub async fn access(&self, path: &str) -> Result<bool, VfsError> { Ok(PageStore::new(self.ctx.clone(), path)?.exists().await?) }

    /// Delete superseded page versions of `path` now, except those a registered reader may still need.
    pub async fn purge(&self, path: &str) -> Result<PurgeOutcome, VfsError> {
        let store = PageStore::new(self.ctx.clone(), path)?;
        Ok(atomic::purge(&store, &self.host, None).await?)
    }

    pub fn open_files(&self) -> usize { self.files.len() }

    pub async fn read(&self, handle: FileHandle, buf: &mut [u8], offset: u64) -> Result<ReadOutcome, VfsError> {
        self.file(handle)?.read(buf, offset).await
    }

    pub async fn write(&self, handle: FileHandle, data: &[u8], offset: u64) -> Result<(), VfsError> { self.file(handle)?.write(data, offset).await }

    pub async fn truncate(&self, handle: FileHandle, size: u64) -> Result<(), VfsError> { self.file(handle)?.truncate(size).await }

    pub async fn sync(&self, handle: FileHandle, flags: SyncFlags) -> Result<(), VfsError> { self.file(handle)?.sync(flags).await }

    pub async fn file_size(&self, handle: FileHandle) -> Result<u64, VfsError> { self.file(handle)?.file_size().await }

    pub async fn lock(&self, handle: FileHandle, level: LockState) -> Result<(), VfsError> { self.file(handle)?.lock(level).await }

    pub async fn unlock(&self, handle: FileHandle, level: LockState) -> Result<(), VfsError> { self.file(handle)?.unlock(level).await }

    pub async fn check_reserved_lock(&self, handle: FileHandle) -> Result<bool, VfsError> { self.file(handle)?.check_reserved_lock().await }

    pub async fn file_control(&self, handle: FileHandle, op: FileControl) -> Result<(), VfsError> {
        self.file(handle)?.file_control(op).await
    }
}
