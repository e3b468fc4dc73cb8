use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, warn};
use ulid::Ulid;

use super::host::VfsHost;
use super::page::{Page, Superblock};
use super::page_store::{PageStore, PurgeOutcome};
use crate::config::PurgeMode;
use crate::error::{StorageError, VfsError};

/// In-memory view of one open file: the superblock it resolves pages against plus writes not yet stored.
#[derive(Debug, Default)]
pub struct FileState {
    pub superblock: Superblock,
    /// Buffered page writes by offset, last write wins. Offset 0 lives in the superblock instead.
    pub pending: BTreeMap<u64, Vec<u8>>,
    /// The superblock differs from the stored one
    pub dirty: bool,
    pub batch: Option<Batch>,
    /// Raised by the engine when it rewrites the whole file, possibly with a new page size
    pub overwrite: bool,
}

/// An open atomic write span.
#[derive(Debug)]
pub struct Batch {
    previous: Superblock,
    changed: BTreeSet<u64>,
    truncated_to: Option<u64>,
}

impl FileState {
    pub fn new(superblock: Superblock) -> Self { Self { superblock, ..Default::default() } }

    pub fn in_batch(&self) -> bool { self.batch.is_some() }
}

/// Groups the writes of one engine transaction and publishes them with a single superblock write.
pub struct AtomicWriteCoordinator {
    store: PageStore,
    host: Arc<VfsHost>,
    reader: Ulid,
    purge: PurgeMode,
    purge_at_least: u64,
}

impl AtomicWriteCoordinator {
    pub fn new(store: PageStore, host: Arc<VfsHost>, reader: Ulid, purge: PurgeMode, purge_at_least: u64) -> Self {
        Self { store, host, reader, purge, purge_at_least }
    }

    pub fn store(&self) -> &PageStore { &self.store }

    /// Open a write span at the next version. Pages a crashed writer left at that version are removed first.
    pub async fn begin(&self, state: &mut FileState) -> Result<(), VfsError> {
        if state.in_batch() {
            return Err(VfsError::Lock("atomic write already in progress".into()));
        }
        if !state.pending.is_empty() || state.dirty {
            self.flush(state).await?;
        }
        let previous = state.superblock.clone();
        let version = previous.version + 1;
        let stale = self.store.delete_versions_from(version).await?;
        if stale > 0 {
            warn!("{}: removed {} pages of an unfinished write at version {}", self.store.path(), stale, version);
        }
        state.superblock.version = version;
        state.batch = Some(Batch { previous, changed: BTreeSet::new(), truncated_to: None });
        debug!("{}: begin atomic write v{}", self.store.path(), version);
        Ok(())
    }

    pub fn write(&self, state: &mut FileState, offset: u64, data: &[u8]) {
        let end = offset + data.len() as u64;
        let grows = end > state.superblock.file_size;
        state.superblock.file_size = state.superblock.file_size.max(end);
        state.dirty = true;

        if offset == 0 {
            state.superblock.data = data.to_vec();
        } else {
            // earlier writes wholly inside this one would shadow it when overlaid
            let covered: Vec<u64> = state.pending.range(offset + 1..end).filter(|&(&start, old)| start + old.len() as u64 <= end).map(|(&start, _)| start).collect();
            for start in covered {
                state.pending.remove(&start);
            }
            state.pending.insert(offset, data.to_vec());
        }
        // appended pages have nothing older to purge
        if let Some(batch) = &mut state.batch {
            if !grows && offset != 0 {
                batch.changed.insert(offset);
            }
        }
    }

    pub async fn truncate(&self, state: &mut FileState, size: u64) -> Result<(), VfsError> {
        state.pending.retain(|&offset, _| offset < size);
        state.superblock.file_size = size;
        state.superblock.data.truncate(size as usize);
        match &mut state.batch {
            Some(batch) => {
                batch.truncated_to = Some(batch.truncated_to.map_or(size, |t| t.min(size)));
                batch.changed.retain(|&offset| offset < size);
                state.dirty = true;
            }
            None => {
                self.flush(state).await?;
                self.store.truncate(&state.superblock).await?;
            }
        }
        Ok(())
    }

    /// Persist buffered pages, then the superblock. On failure the previous superblock stays in effect
    /// and the buffered pages are gone.
    pub async fn commit(&self, state: &mut FileState) -> Result<(), VfsError> {
        let Some(batch) = state.batch.take() else { return self.flush(state).await };
        let version = state.superblock.version;
        let pages: Vec<Page> = std::mem::take(&mut state.pending).into_iter().map(|(offset, data)| Page::new(offset, version, data)).collect();
        let changed: Vec<u64> = batch.changed.iter().copied().collect();

        let published = async {
            self.store.write_pages(&pages).await?;
            let count = self.store.publish(&state.superblock, &changed, batch.truncated_to).await?;
            self.store.context().complete().await?;
            self.store.context().commit_barrier().await?;
            Ok::<_, StorageError>(count)
        }
        .await;

        match published {
            Ok(count) => {
                state.dirty = false;
                self.host.snapshots().register(self.store.path(), self.reader, version);
                debug!("{}: committed v{} ({} pages, {} stale)", self.store.path(), version, pages.len(), count);
                self.maybe_purge(count);
                Ok(())
            }
            Err(err) => {
                warn!("{}: commit of v{} failed: {}", self.store.path(), version, err);
                state.superblock = batch.previous;
                state.dirty = false;
                Err(err.into())
            }
        }
    }

    /// Drop the span. Nothing was stored yet, so restoring the superblock in memory is enough.
    pub fn rollback(&self, state: &mut FileState) {
        if let Some(batch) = state.batch.take() {
            debug!("{}: rollback atomic write v{}", self.store.path(), state.superblock.version);
            state.superblock = batch.previous;
            state.pending.clear();
            state.dirty = false;
        }
    }

    /// Store writes made outside an atomic span at the current version.
    pub async fn flush(&self, state: &mut FileState) -> Result<(), VfsError> {
        if state.in_batch() || (state.pending.is_empty() && !state.dirty) {
            return Ok(());
        }
        let version = state.superblock.version;
        let pages: Vec<Page> = state.pending.iter().map(|(&offset, data)| Page::new(offset, version, data.clone())).collect();
        self.store.write_pages(&pages).await?;
        self.store.write_superblock(&state.superblock).await?;
        state.pending.clear();
        state.dirty = false;
        Ok(())
    }

    pub async fn sync(&self, state: &mut FileState) -> Result<(), VfsError> {
        if state.in_batch() {
            return Ok(());
        }
        self.flush(state).await?;
        if state.overwrite {
            self.reblock(state).await?;
        }
        self.store.context().sync().await?;
        Ok(())
    }

    fn maybe_purge(&self, count: u64) {
        if self.purge == PurgeMode::Manual || count < self.purge_at_least {
            return;
        }
        let path = self.store.path().to_owned();
        if !self.host.begin_purge(&path) {
            return;
        }
        let (store, host, reader) = (self.store.clone(), self.host.clone(), self.reader);
        crate::task::spawn("purge", async move {
            // let the committing caller finish first
            tokio::task::yield_now().await;
            match purge(&store, &host, Some(reader)).await {
                Ok(outcome) => debug!("{}: purged {} stale pages, {} deferred", path, outcome.deleted, outcome.deferred),
                Err(err) => warn!("{}: purge failed: {}", path, err),
            }
            host.end_purge(&path);
        });
    }

    /// Reshape every stored page after the engine changed its page size. The old size is the length of the
    /// page held by the superblock, the new one comes from the header in it.
    pub async fn reblock(&self, state: &mut FileState) -> Result<(), VfsError> {
        let sb = &mut state.superblock;
        let old_size = sb.data.len() as u64;
        let (Some(new_size), Some(page_count)) = (sb.page_size(), sb.page_count()) else { return Ok(()) };
        if old_size < 18 || new_size == old_size {
            return Ok(());
        }
        let version = sb.version;
        let file_size = page_count * new_size;
        let chunk = old_size.max(new_size);
        debug!("{}: reblocking {} -> {} bytes per page", self.store.path(), old_size, new_size);

        self.store.delete_versions_below(version).await?;

        let mut offset = 0;
        while offset < file_size {
            let mut written = Vec::new();
            if old_size < new_size {
                let mut combined = vec![0u8; new_size as usize];
                for i in 0..new_size / old_size {
                    let at = offset + i * old_size;
                    let data = match at {
                        0 => Some(sb.data.clone()),
                        _ => self.store.read_page(at, version).await?.filter(|p| p.offset == at).map(|p| p.data),
                    };
                    if let Some(data) = data {
                        let start = (i * old_size) as usize;
                        let n = data.len().min(old_size as usize);
                        combined[start..start + n].copy_from_slice(&data[..n]);
                    }
                }
                written.push(Page::new(offset, version, combined));
            } else {
                let old = match offset {
                    0 => Some(sb.data.clone()),
                    _ => self.store.read_page(offset, version).await?.filter(|p| p.offset == offset).map(|p| p.data),
                };
                if let Some(old) = old {
                    for (i, piece) in old.chunks(new_size as usize).enumerate() {
                        let at = offset + i as u64 * new_size;
                        if at >= file_size {
                            break;
                        }
                        written.push(Page::new(at, version, piece.to_vec()));
                    }
                }
            }

            self.store.delete_range(offset.max(1), offset + chunk).await?;
            for page in written {
                if page.offset == 0 {
                    sb.data = page.data;
                } else {
                    self.store.write_page(&page).await?;
                }
            }
            offset += chunk;
        }

        sb.file_size = file_size;
        self.store.write_superblock(sb).await?;
        state.dirty = false;
        Ok(())
    }
}

/// Run a purge of the store's file now, respecting readers registered on `host`.
pub async fn purge(store: &PageStore, host: &VfsHost, except: Option<Ulid>) -> Result<PurgeOutcome, StorageError> {
    let oldest = host.snapshots().oldest(store.path(), except);
    let outcome = store.purge(oldest).await?;
    store.context().complete().await?;
    Ok(outcome)
}
