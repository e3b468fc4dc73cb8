//! The backing transactional key-value store contract.
//!
//! Page files live in an ordered byte-keyed store. Everything above this module talks to the store
//! only through [`StorageEngine`] and [`StorageTransaction`], so any store offering ordered range
//! scans and atomic multi-key commits can host a database.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::StorageError;

pub mod memory;

pub use memory::MemoryStorageEngine;

pub type Entry = (Vec<u8>, Vec<u8>);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
}

impl std::fmt::Display for TransactionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionMode::ReadOnly => write!(f, "readonly"),
            TransactionMode::ReadWrite => write!(f, "readwrite"),
        }
    }
}

/// An ordered range of byte keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    pub start: Bound<Vec<u8>>,
    pub end: Bound<Vec<u8>>,
}

impl KeyRange {
    pub fn new(start: Bound<Vec<u8>>, end: Bound<Vec<u8>>) -> Self { Self { start, end } }

    /// `[start, end)`
    pub fn half_open(start: Vec<u8>, end: Vec<u8>) -> Self { Self { start: Bound::Included(start), end: Bound::Excluded(end) } }

    /// Every key beginning with `prefix`
    pub fn prefix(prefix: &[u8]) -> Self {
        let end = match prefix_successor(prefix) {
            Some(end) => Bound::Excluded(end),
            None => Bound::Unbounded,
        };
        Self { start: Bound::Included(prefix.to_vec()), end }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        let after_start = match &self.start {
            Bound::Included(s) => key >= s.as_slice(),
            Bound::Excluded(s) => key > s.as_slice(),
            Bound::Unbounded => true,
        };
        let before_end = match &self.end {
            Bound::Included(e) => key <= e.as_slice(),
            Bound::Excluded(e) => key < e.as_slice(),
            Bound::Unbounded => true,
        };
        after_start && before_end
    }

    pub fn as_bounds(&self) -> (Bound<&[u8]>, Bound<&[u8]>) { (as_ref(&self.start), as_ref(&self.end)) }
}

fn as_ref(b: &Bound<Vec<u8>>) -> Bound<&[u8]> {
    match b {
        Bound::Included(v) => Bound::Included(v.as_slice()),
        Bound::Excluded(v) => Bound::Excluded(v.as_slice()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

/// The smallest key greater than every key that starts with `prefix`, if there is one.
pub fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}

#[async_trait]
pub trait StorageEngine: Send + Sync + 'static {
    /// Start a transaction. Read-write transactions see their own writes and publish them atomically on commit.
    async fn begin(&self, mode: TransactionMode) -> Result<Arc<dyn StorageTransaction>, StorageError>;

    /// Push everything committed so far to stable storage.
    async fn flush(&self) -> Result<(), StorageError>;
}

#[async_trait]
pub trait StorageTransaction: Send + Sync {
    fn mode(&self) -> TransactionMode;

    /// False once the transaction committed, aborted or expired.
    fn is_active(&self) -> bool;

    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    /// Entries in ascending key order, at most `limit` of them.
    async fn scan(&self, range: &KeyRange, limit: Option<usize>) -> Result<Vec<Entry>, StorageError>;

    async fn first(&self, range: &KeyRange) -> Result<Option<Entry>, StorageError> {
        Ok(self.scan(range, Some(1)).await?.into_iter().next())
    }

    async fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError>;

    async fn delete(&self, key: &[u8]) -> Result<(), StorageError>;

    async fn delete_range(&self, range: &KeyRange) -> Result<(), StorageError> {
        for (key, _) in self.scan(range, None).await? {
            self.delete(&key).await?;
        }
        Ok(())
    }

    async fn commit(&self) -> Result<(), StorageError>;

    /// Discard all writes. Calling this on a finished transaction does nothing.
    fn abort(&self);
}

/// Uncommitted writes of a read-write transaction, layered over the committed view of the store.
/// `None` marks a deletion.
#[derive(Debug, Default)]
pub struct WriteSet {
    entries: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl WriteSet {
    pub fn new() -> Self { Self::default() }

    pub fn put(&mut self, key: &[u8], value: &[u8]) { self.entries.insert(key.to_vec(), Some(value.to_vec())); }

    pub fn delete(&mut self, key: &[u8]) { self.entries.insert(key.to_vec(), None); }

    /// `Some(None)` means the key was deleted in this transaction.
    pub fn get(&self, key: &[u8]) -> Option<Option<&[u8]>> { self.entries.get(key).map(|v| v.as_deref()) }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
    pub fn len(&self) -> usize { self.entries.len() }

    /// How many extra committed entries a scan must fetch so that deletions here can't starve a limit.
    pub fn deletions_in(&self, range: &KeyRange) -> usize {
        self.entries.range::<[u8], _>(range.as_bounds()).filter(|(_, v)| v.is_none()).count()
    }

    /// Merge a committed scan of `range` with the writes in this set.
    pub fn overlay(&self, committed: Vec<Entry>, range: &KeyRange, limit: Option<usize>) -> Vec<Entry> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = committed.into_iter().collect();
        for (key, value) in self.entries.range::<[u8], _>(range.as_bounds()) {
            match value {
                Some(value) => merged.insert(key.clone(), value.clone()),
                None => merged.remove(key),
            };
        }
        let iter = merged.into_iter();
        match limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        }
    }

    pub fn drain(&mut self) -> impl Iterator<Item = (Vec<u8>, Option<Vec<u8>>)> { std::mem::take(&mut self.entries).into_iter() }

    pub fn clear(&mut self) { self.entries.clear() }
}
