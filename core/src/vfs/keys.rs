//! Key layout of one file inside the backing store.
//!
//! ```text
//! <path> 0x00 'S'                                   superblock
//! <path> 0x00 'P'                                   purge record
//! <path> 0x00 'B' <!offset: u64 BE> <!version: u64 BE>  page
//! <path> 0x00 'V' <version: u64 BE> <offset: u64 BE>    version index entry
//! ```
//!
//! Page keys store the bitwise complement of offset and version, so ascending key order is
//! descending offset and, within one offset, newest version first. Seeking to
//! `page(offset, snapshot)` therefore lands on the newest version visible to that snapshot.

use std::ops::Bound;

use crate::error::VfsError;
use crate::storage::KeyRange;

const SUPERBLOCK: u8 = b'S';
const PURGE: u8 = b'P';
const PAGE: u8 = b'B';
const VERSION: u8 = b'V';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileKeys {
    prefix: Vec<u8>,
}

impl FileKeys {
    pub fn new(path: &str) -> Result<Self, VfsError> {
        if path.is_empty() || path.as_bytes().contains(&0) {
            return Err(VfsError::CantOpen(path.escape_debug().to_string()));
        }
        let mut prefix = Vec::with_capacity(path.len() + 1);
        prefix.extend_from_slice(path.as_bytes());
        prefix.push(0);
        Ok(Self { prefix })
    }

    fn tagged(&self, tag: u8, capacity: usize) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.prefix.len() + 1 + capacity);
        key.extend_from_slice(&self.prefix);
        key.push(tag);
        key
    }

    /// Every key of the file
    pub fn all(&self) -> KeyRange { KeyRange::prefix(&self.prefix) }

    pub fn superblock(&self) -> Vec<u8> { self.tagged(SUPERBLOCK, 0) }

    pub fn purge(&self) -> Vec<u8> { self.tagged(PURGE, 0) }

    pub fn page(&self, offset: u64, version: u64) -> Vec<u8> {
        let mut key = self.tagged(PAGE, 16);
        key.extend_from_slice(&(!offset).to_be_bytes());
        key.extend_from_slice(&(!version).to_be_bytes());
        key
    }

    pub fn decode_page(&self, key: &[u8]) -> Result<(u64, u64), VfsError> {
        let rest = self.strip(key, PAGE)?;
        let (offset, version) = split_u64_pair(rest).ok_or_else(|| corrupt(key))?;
        Ok((!offset, !version))
    }

    /// All page keys of the file
    pub fn pages(&self) -> KeyRange { KeyRange::prefix(&self.tagged(PAGE, 0)) }

    /// Pages whose offset is at most `offset`, starting at the newest version not newer than `version`.
    pub fn seek_page(&self, offset: u64, version: u64) -> KeyRange {
        KeyRange::new(Bound::Included(self.page(offset, version)), self.pages().end)
    }

    /// Every version of pages with an offset of at least `offset`.
    pub fn pages_from(&self, offset: u64) -> KeyRange { KeyRange::new(self.pages().start, Bound::Included(self.page(offset, 0))) }

    /// Every version of pages with an offset in `[from, to)`.
    pub fn pages_between(&self, from: u64, to: u64) -> KeyRange {
        if to == 0 {
            return KeyRange::half_open(self.page(0, 0), self.page(0, 0));
        }
        KeyRange::new(Bound::Included(self.page(to - 1, u64::MAX)), Bound::Included(self.page(from, 0)))
    }

    /// Versions of the page at `offset` strictly older than `version`.
    pub fn versions_older_than(&self, offset: u64, version: u64) -> KeyRange {
        KeyRange::new(Bound::Excluded(self.page(offset, version)), Bound::Included(self.page(offset, 0)))
    }

    pub fn version_entry(&self, version: u64, offset: u64) -> Vec<u8> {
        let mut key = self.tagged(VERSION, 16);
        key.extend_from_slice(&version.to_be_bytes());
        key.extend_from_slice(&offset.to_be_bytes());
        key
    }

    pub fn decode_version_entry(&self, key: &[u8]) -> Result<(u64, u64), VfsError> {
        let rest = self.strip(key, VERSION)?;
        split_u64_pair(rest).ok_or_else(|| corrupt(key))
    }

    /// Index entries of versions at or above `version`.
    pub fn versions_from(&self, version: u64) -> KeyRange {
        KeyRange::new(Bound::Included(self.version_entry(version, 0)), KeyRange::prefix(&self.tagged(VERSION, 0)).end)
    }

    /// Index entries of versions strictly below `version`.
    pub fn versions_below(&self, version: u64) -> KeyRange {
        KeyRange::half_open(self.tagged(VERSION, 0), self.version_entry(version, 0))
    }

    fn strip<'a>(&self, key: &'a [u8], tag: u8) -> Result<&'a [u8], VfsError> {
        key.strip_prefix(self.prefix.as_slice())
            .and_then(|rest| rest.split_first())
            .filter(|(t, _)| **t == tag)
            .map(|(_, rest)| rest)
            .ok_or_else(|| corrupt(key))
    }
}

fn split_u64_pair(bytes: &[u8]) -> Option<(u64, u64)> {
    if bytes.len() != 16 {
        return None;
    }
    let (a, b) = bytes.split_at(8);
    Some((u64::from_be_bytes(a.try_into().ok()?), u64::from_be_bytes(b.try_into().ok()?)))
}

fn corrupt(key: &[u8]) -> VfsError { VfsError::Corrupt(format!("unexpected key {}", String::from_utf8_lossy(key))) }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_keys_sort_by_offset_desc_then_version_desc() {
        let keys = FileKeys::new("main.db").unwrap();
        let mut sorted = vec![keys.page(4096, 1), keys.page(8192, 1), keys.page(4096, 3), keys.page(4096, 2)];
        sorted.sort();
        let decoded: Vec<_> = sorted.iter().map(|k| keys.decode_page(k).unwrap()).collect();
        assert_eq!(decoded, vec![(8192, 1), (4096, 3), (4096, 2), (4096, 1)]);
    }

    #[test]
    fn ranges_select_the_expected_pages() {
        let keys = FileKeys::new("main.db").unwrap();
        assert!(keys.seek_page(4096, 2).contains(&keys.page(4096, 2)));
        assert!(!keys.seek_page(4096, 2).contains(&keys.page(4096, 3)));
        assert!(keys.seek_page(4096, 2).contains(&keys.page(1024, 9)));

        assert!(keys.pages_from(4096).contains(&keys.page(4096, 0)));
        assert!(keys.pages_from(4096).contains(&keys.page(1 << 40, 7)));
        assert!(!keys.pages_from(4096).contains(&keys.page(1024, 7)));

        let between = keys.pages_between(1024, 4096);
        assert!(between.contains(&keys.page(1024, 5)));
        assert!(between.contains(&keys.page(2048, 0)));
        assert!(!between.contains(&keys.page(4096, 5)));
        assert!(!between.contains(&keys.page(0, 5)));

        let older = keys.versions_older_than(4096, 5);
        assert!(older.contains(&keys.page(4096, 4)));
        assert!(!older.contains(&keys.page(4096, 5)));
        assert!(!older.contains(&keys.page(4096, 6)));
        assert!(!older.contains(&keys.page(2048, 1)));

        assert!(keys.versions_from(3).contains(&keys.version_entry(3, 0)));
        assert!(!keys.versions_from(3).contains(&keys.version_entry(2, u64::MAX)));
        assert!(keys.versions_below(3).contains(&keys.version_entry(2, u64::MAX)));
        assert!(!keys.all().contains(&FileKeys::new("main.db-journal").unwrap().superblock()));
    }

    #[test]
    fn rejects_paths_that_would_break_the_layout() {
        assert!(FileKeys::new("a\0b").is_err());
        assert!(FileKeys::new("").is_err());
        let keys = FileKeys::new("x").unwrap();
        assert!(keys.decode_page(&keys.superblock()).is_err());
    }
}
