use ledgerwatch_core::AppError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        AppError::Database(err.to_string())
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
