use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A fixed-size block of the page file at one version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub offset: u64,
    pub version: u64,
    pub data: Vec<u8>,
}

impl Page {
    pub fn new(offset: u64, version: u64, data: Vec<u8>) -> Self { Self { offset, version, data } }

    pub fn end(&self) -> u64 { self.offset + self.data.len() as u64 }

    pub fn covers(&self, offset: u64) -> bool { offset >= self.offset && offset < self.end() }
}

/// The page at offset 0 together with the file metadata. Writing it is what publishes a commit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub file_size: u64,
    pub version: u64,
    pub data: Vec<u8>,
}

impl Superblock {
    /// Page size recorded in the database header, if the header is present.
    pub fn page_size(&self) -> Option<u64> {
        let bytes = self.data.get(16..18)?;
        match u16::from_be_bytes([bytes[0], bytes[1]]) {
            0 => None,
            1 => Some(65536),
            size => Some(size as u64),
        }
    }

    /// Page count recorded in the database header, if the header is present.
    pub fn page_count(&self) -> Option<u64> {
        let bytes = self.data.get(28..32)?;
        Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as u64)
    }
}

/// Stale pages accumulated across commits: for each offset, the version that superseded all older ones.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeRecord {
    pub count: u64,
    pub pages: BTreeMap<u64, u64>,
}

impl PurgeRecord {
    pub fn record(&mut self, version: u64, offsets: impl IntoIterator<Item = u64>) {
        for offset in offsets {
            self.pages.insert(offset, version);
            self.count += 1;
        }
    }
}
