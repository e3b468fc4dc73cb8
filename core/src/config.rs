//! Option structs for the storage backend, the scheduler and the client.
//!
//! Everything here deserializes with serde and has a `Default` that matches the behavior
//! you get when passing nothing, so a partial config file only names what it changes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How eagerly committed data is pushed to stable storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Durability {
    /// Sync only publishes the lease; the store flushes whenever it likes.
    Relaxed,
    /// Sync publishes the lease and flushes the store.
    #[default]
    Default,
    /// Like `Default`, and every atomic commit flushes as well.
    Strict,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PurgeMode {
    /// Stale versions are deleted by a background task once enough accumulate.
    #[default]
    Deferred,
    /// Stale versions stay until [`crate::vfs::Vfs::purge`] is called.
    Manual,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockPolicy {
    /// Readers share the file, a writer escalates through RESERVED and EXCLUSIVE.
    #[default]
    Shared,
    /// Any lock at all is an exclusive lock on the file.
    Exclusive,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    /// Versioned pages published by a single superblock write.
    #[default]
    BatchAtomic,
    /// Unversioned pages cached while EXCLUSIVE and bulk-written at unlock. Not crash-atomic.
    CachedWrites,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VfsOptions {
    pub mode: StorageMode,
    pub durability: Durability,
    pub purge: PurgeMode,
    /// Minimum number of stale pages before a deferred purge is scheduled.
    pub purge_at_least: u64,
    pub lock_policy: LockPolicy,
    /// Give up waiting for a lock after this long and report BUSY.
    #[serde(with = "opt_millis")]
    pub lock_timeout: Option<Duration>,
    /// Upper bound of the backoff while polling for RESERVED.
    #[serde(with = "millis")]
    pub max_retry: Duration,
}

impl Default for VfsOptions {
    fn default() -> Self {
        Self {
            mode: StorageMode::BatchAtomic,
            durability: Durability::Default,
            purge: PurgeMode::Deferred,
            purge_at_least: 16,
            lock_policy: LockPolicy::Shared,
            lock_timeout: None,
            max_retry: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    #[serde(with = "millis")]
    pub acquire_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self { Self { acquire_timeout: Duration::from_secs(120) } }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    pub name: String,
    /// Don't log query text and timings.
    pub suppress_log: bool,
    pub scheduler: SchedulerConfig,
}

impl Default for DbConfig {
    fn default() -> Self { Self { name: "default".into(), suppress_log: false, scheduler: SchedulerConfig::default() } }
}

impl DbConfig {
    pub fn named(name: impl Into<String>) -> Self { Self { name: name.into(), ..Default::default() } }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> { s.serialize_u64(d.as_millis() as u64) }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> { Ok(Duration::from_millis(u64::deserialize(d)?)) }
}

mod opt_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
