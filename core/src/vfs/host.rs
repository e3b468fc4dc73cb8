use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use dashmap::{DashMap, DashSet};
use ulid::Ulid;

use super::platform::{LocalLockProvider, LockProvider};

/// Process-wide coordination shared by every [`super::Vfs`] that opens the same files: the named lock
/// provider, the snapshots readers currently resolve pages against, and the files with a purge pending.
pub struct VfsHost {
    locks: Arc<dyn LockProvider>,
    snapshots: SnapshotRegistry,
    purges: DashSet<String>,
}

static GLOBAL: OnceLock<Arc<VfsHost>> = OnceLock::new();

impl VfsHost {
    pub fn new(locks: Arc<dyn LockProvider>) -> Self { Self { locks, snapshots: SnapshotRegistry::default(), purges: DashSet::new() } }

    /// A host with its own in-process locks. Contexts that should see each other must share one.
    pub fn local() -> Arc<Self> { Arc::new(Self::new(Arc::new(LocalLockProvider::new()))) }

    pub fn global() -> Arc<Self> { GLOBAL.get_or_init(Self::local).clone() }

    pub fn locks(&self) -> &Arc<dyn LockProvider> { &self.locks }
    pub fn snapshots(&self) -> &SnapshotRegistry { &self.snapshots }

    /// Marks a purge of `path` as pending. False if one already is.
    pub(crate) fn begin_purge(&self, path: &str) -> bool { self.purges.insert(path.to_owned()) }
    pub(crate) fn end_purge(&self, path: &str) { self.purges.remove(path); }
}

/// Superblock versions that open readers are resolving pages against, per file.
#[derive(Default)]
pub struct SnapshotRegistry {
    readers: DashMap<String, HashMap<Ulid, u64>>,
}

impl SnapshotRegistry {
    pub fn register(&self, path: &str, reader: Ulid, version: u64) { self.readers.entry(path.to_owned()).or_default().insert(reader, version); }

    pub fn release(&self, path: &str, reader: Ulid) {
        if let Some(mut readers) = self.readers.get_mut(path) {
            readers.remove(&reader);
        }
        self.readers.remove_if(path, |_, readers| readers.is_empty());
    }

    /// The oldest snapshot in use on `path`, ignoring `except`.
    pub fn oldest(&self, path: &str, except: Option<Ulid>) -> Option<u64> {
        let readers = self.readers.get(path)?;
        readers.iter().filter(|(id, _)| Some(**id) != except).map(|(_, v)| *v).min()
    }
}
