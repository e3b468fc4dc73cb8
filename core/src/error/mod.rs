use thiserror::Error;

use crate::scheduler::SchedulerDump;

/// Errors raised by a backing key-value store.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The transaction lease expired or was finished underneath the caller. Retryable with a fresh lease.
    #[error("transaction is no longer active")]
    TransactionInactive,

    #[error("write attempted in a read-only transaction")]
    ReadOnly,

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("serialization error: {0}")]
    SerializationError(Box<dyn std::error::Error + Send + Sync + 'static>),

    #[error("backend error: {0}")]
    BackendError(Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl StorageError {
    pub fn is_retryable(&self) -> bool { matches!(self, StorageError::TransactionInactive) }
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self { StorageError::SerializationError(Box::new(err)) }
}

impl From<tokio::task::JoinError> for StorageError {
    fn from(err: tokio::task::JoinError) -> Self { StorageError::BackendError(Box::new(err)) }
}

/// Result codes understood by the embedded SQL engine.
pub mod code {
    pub const OK: i32 = 0;
    pub const BUSY: i32 = 5;
    pub const IOERR: i32 = 10;
    pub const NOTFOUND: i32 = 12;
    pub const CANTOPEN: i32 = 14;
    pub const MISUSE: i32 = 21;
    pub const IOERR_SHORT_READ: i32 = IOERR | (2 << 8);
    pub const IOERR_LOCK: i32 = IOERR | (15 << 8);
}

/// Errors surfaced through the storage-backend contract.
#[derive(Debug, Error)]
pub enum VfsError {
    /// A lock could not be escalated. The engine retries on its own.
    #[error("busy")]
    Busy,

    #[error("io error: {0}")]
    Io(#[from] StorageError),

    #[error("lock error: {0}")]
    Lock(String),

    #[error("cannot open {0}")]
    CantOpen(String),

    #[error("stale or unknown file handle")]
    BadHandle,

    #[error("unsupported file control")]
    NotFound,

    #[error("corrupt file: {0}")]
    Corrupt(String),
}

impl VfsError {
    /// Busy is the only transient outcome, everything else is fatal for the current operation.
    pub fn is_transient(&self) -> bool { matches!(self, VfsError::Busy) }

    pub fn code(&self) -> i32 {
        match self {
            VfsError::Busy => code::BUSY,
            VfsError::Io(_) | VfsError::Corrupt(_) => code::IOERR,
            VfsError::Lock(_) => code::IOERR_LOCK,
            VfsError::CantOpen(_) => code::CANTOPEN,
            VfsError::BadHandle => code::MISUSE,
            VfsError::NotFound => code::NOTFOUND,
        }
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Acquire exceeded its deadline. Most likely a job waits on a transaction that never finishes.
    #[error("timeout while acquiring job {job}. Is it a dead lock? {state}")]
    Timeout { job: String, state: SchedulerDump },

    /// Releasing a job that is not current. This is a logic bug and the scheduler should not be reused.
    #[error("can't release job that is not currently running: {job}. {state}")]
    InvariantViolation { job: String, state: SchedulerDump },

    #[error("transaction job {0} was not started, nothing to release")]
    NotAcquired(String),
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("error while executing query: {text} - {source}")]
    Query { text: String, source: anyhow::Error },

    #[error("backend is not initialized")]
    NotInitialized,

    #[error("backend is stopped")]
    Stopped,

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum DbError {
    #[error("failed to start {what}, db {db_name} is stopping")]
    NotRunning { db_name: String, what: String },

    #[error("cannot run queries in transaction {requested}, the current transaction is {current:?}")]
    ForeignTransaction { requested: String, current: Option<String> },

    #[error("atomic transaction started inside of a transaction, run it after the transaction commits instead")]
    NestedAtomic,

    #[error("not in a transaction")]
    NotInTransaction,

    #[error("prepared queries take their values from the value sets, use '?' placeholders instead of binding")]
    PreparedWithValues,

    #[error("query run failed on db {db_name}: {source}")]
    QueryRun { db_name: String, queries: Vec<String>, source: BackendError },

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("observer failed: {0}")]
    Observer(anyhow::Error),
}

impl DbError {
    /// Only invariant violations leave the connection unusable.
    pub fn is_fatal(&self) -> bool {
        match self {
            DbError::Scheduler(SchedulerError::InvariantViolation { .. }) => true,
            DbError::Backend(BackendError::Scheduler(SchedulerError::InvariantViolation { .. })) => true,
            DbError::QueryRun { source: BackendError::Scheduler(SchedulerError::InvariantViolation { .. }), .. } => true,
            _ => false,
        }
    }
}
