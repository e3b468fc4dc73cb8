use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use super::keys::FileKeys;
use super::page::{Page, PurgeRecord, Superblock};
use super::ReadOutcome;
use crate::error::{StorageError, VfsError};
use crate::storage::{StorageTransaction, TransactionMode};

/// Versioned page CRUD for one file, on top of the shared [`super::StoreContext`].
#[derive(Clone)]
pub struct PageStore {
    ctx: Arc<super::StoreContext>,
    keys: FileKeys,
    path: String,
}

impl PageStore {
    pub fn new(ctx: Arc<super::StoreContext>, path: &str) -> Result<Self, VfsError> {
        Ok(Self { ctx, keys: FileKeys::new(path)?, path: path.to_owned() })
    }

    pub fn path(&self) -> &str { &self.path }
    pub fn context(&self) -> &Arc<super::StoreContext> { &self.ctx }
    pub fn keys(&self) -> &FileKeys { &self.keys }

    pub async fn read_superblock(&self) -> Result<Option<Superblock>, StorageError> {
        let key = &self.keys.superblock();
        self.ctx
            .run(TransactionMode::ReadOnly, |tx| async move {
                match tx.get(key).await? {
                    Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
                    None => Ok(None),
                }
            })
            .await
    }

    pub async fn write_superblock(&self, superblock: &Superblock) -> Result<(), StorageError> {
        let key = &self.keys.superblock();
        let value = &bincode::serialize(superblock)?;
        self.ctx.run(TransactionMode::ReadWrite, |tx| async move { tx.put(key, value).await }).await
    }

    pub async fn exists(&self) -> Result<bool, StorageError> {
        let key = &self.keys.superblock();
        self.ctx.run(TransactionMode::ReadOnly, |tx| async move { Ok(tx.get(key).await?.is_some()) }).await
    }

    /// The newest version, not newer than `snapshot`, of the page with the greatest offset at or below
    /// `offset`. The page may not reach `offset`; callers check [`Page::covers`].
    pub async fn read_page(&self, offset: u64, snapshot: u64) -> Result<Option<Page>, StorageError> {
        let keys = &self.keys;
        self.ctx.run(TransactionMode::ReadOnly, |tx| async move { seek_page(tx.as_ref(), keys, offset, snapshot).await }).await
    }

    /// Fill `buf` from `offset` as of `superblock`. Bytes below the superblock length come from its data,
    /// the rest from stored pages. A gap or the end of the stored data yields a short read with the unread
    /// remainder zeroed.
    /// Like [`read`](Self::read), with `writes` (by offset, not stored yet) taking precedence over stored pages.
    pub async fn read_with(&self, superblock: &Superblock, offset: u64, buf: &mut [u8], writes: &BTreeMap<u64, Vec<u8>>) -> Result<ReadOutcome, StorageError> {
        let mut filled = 0;
        loop {
            let stored = match self.read(superblock, offset + filled as u64, &mut buf[filled..]).await? {
                ReadOutcome::Complete => buf.len(),
                ReadOutcome::Short { filled: n } => filled + n,
            };
            let next = overlay_writes(writes, offset, buf, stored);
            if next == buf.len() {
                return Ok(ReadOutcome::Complete);
            }
            // a buffered write bridged a missing page, so the store may hold more past it
            if next == stored {
                return Ok(ReadOutcome::Short { filled: next });
            }
            filled = next;
        }
    }

    pub async fn read(&self, superblock: &Superblock, offset: u64, buf: &mut [u8]) -> Result<ReadOutcome, StorageError> {
        let base = superblock.data.len() as u64;
        let mut filled = 0usize;
        if offset < base {
            let n = ((base - offset) as usize).min(buf.len());
            buf[..n].copy_from_slice(&superblock.data[offset as usize..offset as usize + n]);
            filled = n;
        }

        if filled < buf.len() {
            let (keys, snapshot, start, len) = (&self.keys, superblock.version, offset + filled as u64, (buf.len() - filled) as u64);
            let pages = self
                .ctx
                .run(TransactionMode::ReadOnly, |tx| async move {
                    let mut pages = Vec::new();
                    let mut pos = start;
                    while pos < start + len {
                        match seek_page(tx.as_ref(), keys, pos, snapshot).await? {
                            Some(page) if page.covers(pos) => {
                                pos = page.end();
                                pages.push(page);
                            }
                            _ => break,
                        }
                    }
                    Ok(pages)
                })
                .await?;

            for page in pages {
                let pos = offset + filled as u64;
                let skip = (pos - page.offset) as usize;
                let n = (page.data.len() - skip).min(buf.len() - filled);
                buf[filled..filled + n].copy_from_slice(&page.data[skip..skip + n]);
                filled += n;
            }
        }

        if filled < buf.len() {
            buf[filled..].fill(0);
            return Ok(ReadOutcome::Short { filled });
        }
        Ok(ReadOutcome::Complete)
    }

    pub async fn write_pages(&self, pages: &[Page]) -> Result<(), StorageError> {
        if pages.is_empty() {
            return Ok(());
        }
        let keys = &self.keys;
        self.ctx
            .run(TransactionMode::ReadWrite, |tx| async move {
                for page in pages {
                    tx.put(&keys.page(page.offset, page.version), &page.data).await?;
                    tx.put(&keys.version_entry(page.version, page.offset), &[]).await?;
                }
                Ok(())
            })
            .await
    }

    pub async fn write_page(&self, page: &Page) -> Result<(), StorageError> { self.write_pages(std::slice::from_ref(page)).await }

    /// Publish `superblock`, recording `changed` offsets as superseded in the purge record and dropping pages
    /// older than the superblock at or beyond `truncated_to`. Pages of the batch being published survive the
    /// truncation. Returns the accumulated stale page count.
    pub async fn publish(&self, superblock: &Superblock, changed: &[u64], truncated_to: Option<u64>) -> Result<u64, StorageError> {
        let keys = &self.keys;
        let value = &bincode::serialize(superblock)?;
        let version = superblock.version;
        self.ctx
            .run(TransactionMode::ReadWrite, |tx| async move {
                if let Some(size) = truncated_to {
                    delete_pages_below(tx.as_ref(), keys, &keys.pages_from(size), version).await?;
                }
                let mut count = 0;
                if !changed.is_empty() {
                    let mut record = read_purge_record(tx.as_ref(), keys).await?.unwrap_or_default();
                    record.record(version, changed.iter().copied());
                    tx.put(&keys.purge(), &bincode::serialize(&record)?).await?;
                    count = record.count;
                }
                tx.put(&keys.superblock(), value).await?;
                Ok(count)
            })
            .await
    }

    /// Drop every page at or beyond `superblock.file_size` and write the superblock.
    pub async fn truncate(&self, superblock: &Superblock) -> Result<(), StorageError> {
        let keys = &self.keys;
        let value = &bincode::serialize(superblock)?;
        let size = superblock.file_size;
        self.ctx
            .run(TransactionMode::ReadWrite, |tx| async move {
                delete_pages(tx.as_ref(), keys, &keys.pages_from(size)).await?;
                tx.put(&keys.superblock(), value).await
            })
            .await
    }

    /// Delete every version of the pages with an offset in `[from, to)`.
    pub async fn delete_range(&self, from: u64, to: u64) -> Result<usize, StorageError> {
        let keys = &self.keys;
        self.ctx.run(TransactionMode::ReadWrite, |tx| async move { delete_pages(tx.as_ref(), keys, &keys.pages_between(from, to)).await }).await
    }

    /// Delete pages written at `version` or later. Used to clear what an uncommitted writer left behind.
    pub async fn delete_versions_from(&self, version: u64) -> Result<usize, StorageError> {
        let keys = &self.keys;
        self.ctx
            .run(TransactionMode::ReadWrite, |tx| async move { delete_indexed(tx.as_ref(), keys, &keys.versions_from(version)).await })
            .await
    }

    /// Delete pages older than `version`, together with the purge record that tracked them.
    pub async fn delete_versions_below(&self, version: u64) -> Result<usize, StorageError> {
        let keys = &self.keys;
        self.ctx
            .run(TransactionMode::ReadWrite, |tx| async move {
                let deleted = delete_indexed(tx.as_ref(), keys, &keys.versions_below(version)).await?;
                tx.delete(&keys.purge()).await?;
                Ok(deleted)
            })
            .await
    }

    pub async fn read_purge_record(&self) -> Result<Option<PurgeRecord>, StorageError> {
        let keys = &self.keys;
        self.ctx.run(TransactionMode::ReadOnly, |tx| async move { read_purge_record(tx.as_ref(), keys).await }).await
    }

    /// Delete superseded page versions. Offsets whose superseding version is newer than `oldest_reader`
    /// stay in the record for a later run, since that reader may still resolve to an older version.
    pub async fn purge(&self, oldest_reader: Option<u64>) -> Result<PurgeOutcome, StorageError> {
        let keys = &self.keys;
        self.ctx
            .run(TransactionMode::ReadWrite, |tx| async move {
                let Some(record) = read_purge_record(tx.as_ref(), keys).await? else { return Ok(PurgeOutcome::default()) };
                let mut outcome = PurgeOutcome::default();
                let mut kept = PurgeRecord::default();
                for (&offset, &version) in &record.pages {
                    if oldest_reader.is_some_and(|snapshot| snapshot < version) {
                        kept.record(version, [offset]);
                        continue;
                    }
                    outcome.deleted += delete_pages(tx.as_ref(), keys, &keys.versions_older_than(offset, version)).await?;
                }
                outcome.deferred = kept.pages.len();
                if kept.pages.is_empty() {
                    tx.delete(&keys.purge()).await?;
                } else {
                    tx.put(&keys.purge(), &bincode::serialize(&kept)?).await?;
                }
                Ok(outcome)
            })
            .await
    }

    /// Every page of the file, at all versions, in ascending offset order.
    pub async fn all_pages(&self) -> Result<Vec<Page>, StorageError> {
        let keys = &self.keys;
        let mut pages = self
            .ctx
            .run(TransactionMode::ReadOnly, |tx| async move {
                let mut pages = Vec::new();
                for (key, data) in tx.scan(&keys.pages(), None).await? {
                    let (offset, version) = keys.decode_page(&key).map_err(invalid)?;
                    pages.push(Page { offset, version, data });
                }
                Ok(pages)
            })
            .await?;
        pages.reverse();
        Ok(pages)
    }

    /// The page with the highest offset, any version
    pub async fn last_page(&self) -> Result<Option<Page>, StorageError> {
        let keys = &self.keys;
        self.ctx
            .run(TransactionMode::ReadOnly, |tx| async move {
                match tx.first(&keys.pages()).await? {
                    Some((key, data)) => {
                        let (offset, version) = keys.decode_page(&key).map_err(invalid)?;
                        Ok(Some(Page { offset, version, data }))
                    }
                    None => Ok(None),
                }
            })
            .await
    }

    /// Remove every key of the file.
    pub async fn delete_file(&self) -> Result<(), StorageError> {
        let keys = &self.keys;
        self.ctx.run(TransactionMode::ReadWrite, |tx| async move { tx.delete_range(&keys.all()).await }).await?;
        debug!("{}: deleted {}", self.ctx.name(), self.path);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeOutcome {
    /// Page versions deleted
    pub deleted: usize,
    /// Offsets left for a later purge because a reader may still need them
    pub deferred: usize,
}

fn invalid(err: VfsError) -> StorageError { StorageError::InvalidKey(err.to_string()) }

async fn seek_page(tx: &dyn StorageTransaction, keys: &FileKeys, offset: u64, snapshot: u64) -> Result<Option<Page>, StorageError> {
    let mut target = offset;
    loop {
        let Some((key, data)) = tx.first(&keys.seek_page(target, snapshot)).await? else { return Ok(None) };
        let (page_offset, version) = keys.decode_page(&key).map_err(invalid)?;
        if version <= snapshot {
            return Ok(Some(Page { offset: page_offset, version, data }));
        }
        // a lower offset written after the snapshot; look for an older version of it
        if page_offset == 0 {
            return Ok(None);
        }
        target = page_offset;
    }
}

async fn read_purge_record(tx: &dyn StorageTransaction, keys: &FileKeys) -> Result<Option<PurgeRecord>, StorageError> {
    match tx.get(&keys.purge()).await? {
        Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
        None => Ok(None),
    }
}

/// Delete the pages in `range` along with their version index entries.
async fn delete_pages(tx: &dyn StorageTransaction, keys: &FileKeys, range: &crate::storage::KeyRange) -> Result<usize, StorageError> {
    delete_pages_below(tx, keys, range, u64::MAX).await
}

/// Delete the pages in `range` written before version `below`.
async fn delete_pages_below(tx: &dyn StorageTransaction, keys: &FileKeys, range: &crate::storage::KeyRange, below: u64) -> Result<usize, StorageError> {
    let mut deleted = 0;
    for (key, _) in tx.scan(range, None).await? {
        let (offset, version) = keys.decode_page(&key).map_err(invalid)?;
        if version >= below {
            continue;
        }
        tx.delete(&key).await?;
        tx.delete(&keys.version_entry(version, offset)).await?;
        deleted += 1;
    }
    Ok(deleted)
}

/// Delete the pages listed by the version index entries in `range`.
async fn delete_indexed(tx: &dyn StorageTransaction, keys: &FileKeys, range: &crate::storage::KeyRange) -> Result<usize, StorageError> {
    let entries = tx.scan(range, None).await?;
    for (key, _) in &entries {
        let (version, offset) = keys.decode_version_entry(key).map_err(invalid)?;
        tx.delete(&keys.page(offset, version)).await?;
        tx.delete(key).await?;
    }
    Ok(entries.len())
}

/// Copy every write that intersects `[offset, offset + buf.len())` over `buf`. `filled` counts the leading
/// bytes of `buf` already holding file data; returns it extended by writes contiguous with it.
fn overlay_writes(writes: &BTreeMap<u64, Vec<u8>>, offset: u64, buf: &mut [u8], mut filled: usize) -> usize {
    let end = offset + buf.len() as u64;
    for (&start, data) in writes.range(..end) {
        let (from, to) = (start.max(offset), (start + data.len() as u64).min(end));
        if from >= to {
            continue;
        }
        buf[(from - offset) as usize..(to - offset) as usize].copy_from_slice(&data[(from - start) as usize..(to - start) as usize]);
        if from <= offset + filled as u64 {
            filled = filled.max((to - offset) as usize);
        }
    }
    filled
}

