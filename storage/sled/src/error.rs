use strata_core::error::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SledError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl From<SledError> for StorageError {
    fn from(err: SledError) -> Self { StorageError::BackendError(Box::new(err)) }
}

pub fn sled_error(err: sled::Error) -> StorageError { SledError::Sled(err).into() }
