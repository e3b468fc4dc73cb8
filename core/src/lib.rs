pub mod backend;
pub mod config;
pub mod db;
pub mod error;
pub mod livequery;
pub mod notify;
pub mod scheduler;
pub mod storage;
pub mod task;
pub mod util;
pub mod vfs;

pub use backend::{DbBackend, Query, QueryBatch, QueryExecutor, QueryResult, QueryRunner, TableRef, TransactionOpts, Value};
pub use db::{Db, DbObserver, RunningState, Transaction, TransactionKind};
pub use livequery::LiveQuery;
pub use notify::{ChangeMessage, ChangeNotifier, ChannelHub};
pub use scheduler::JobScheduler;
pub use storage::{MemoryStorageEngine, StorageEngine, StorageTransaction};
pub use vfs::Vfs;

#[cfg(test)]
#[ctor::ctor]
fn init_tracing() {
    let level = std::env::var("LOG_LEVEL").ok().and_then(|level| level.parse().ok()).unwrap_or(tracing::Level::INFO);
    let _ = tracing_subscriber::fmt().with_max_level(level).with_test_writer().try_init();
}
