//! # Strata
//!
//! Strata lets an embedded SQL engine keep its page file in a transactional key-value store, and
//! lets several execution contexts share that database safely.
//!
//! ## Key Features
//!
//! - **Versioned pages**: every page write is stored under a version, so a batch of page writes
//!   becomes visible all at once or not at all, without a journal file
//! - **Advisory locks**: the engine's five lock levels, shared between contexts through a lock provider
//! - **One connection, many callers**: a FIFO job scheduler keeps transactions from interleaving
//! - **Live queries**: writes publish the tables they touched as `{"changesInTables": [...]}`, and
//!   queries reading those tables re-run
//!
//! ## Example: Atomic Page Writes
//!
//! ```rust
//! # use std::sync::Arc;
//! # use strata::storage::MemoryStorageEngine;
//! # use strata::vfs::{FileControl, LockState, OpenFlags, Vfs};
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let vfs = Vfs::new("app", Arc::new(MemoryStorageEngine::new()), Default::default());
//!     let (file, _) = vfs.open("main.db", OpenFlags::CREATE | OpenFlags::READWRITE).await?;
//!
//!     vfs.lock(file, LockState::Exclusive).await?;
//!     vfs.file_control(file, FileControl::BeginAtomicWrite).await?;
//!     vfs.write(file, &[1; 4096], 0).await?;
//!     vfs.write(file, &[2; 4096], 4096).await?;
//!     vfs.file_control(file, FileControl::CommitAtomicWrite).await?;
//!     vfs.unlock(file, LockState::None).await?;
//!
//!     assert_eq!(vfs.file_size(file).await?, 8192);
//!     vfs.close(file).await?;
//! #   Ok(())
//! # }
//! ```
//!
//! Above the page layer, [`Db`] runs queries through a [`QueryExecutor`] one job at a time, and
//! [`ChangeNotifier`] plus [`LiveQuery`] keep reactive results current.

pub use strata_core as core;
#[cfg(feature = "sled")]
pub use strata_storage_sled as sled;

// Re-export commonly used types
pub use strata_core::{
    backend, config, db, error, livequery, notify, scheduler, storage, vfs, ChangeMessage, ChangeNotifier, ChannelHub, Db, DbBackend,
    DbObserver, JobScheduler, LiveQuery, Query, QueryExecutor, QueryRunner, TableRef, Transaction, TransactionKind, Value,
};
