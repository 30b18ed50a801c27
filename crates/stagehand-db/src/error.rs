//! Database error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    /// The stored version no longer matches the one the caller read.
    #[error("optimistic lock error")]
    OptimisticLock,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type DbResult<T> = std::result::Result<T, DbError>;

impl From<DbError> for stagehand_core::Error {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(what) => stagehand_core::Error::NotFound(what),
            DbError::OptimisticLock => stagehand_core::Error::OptimisticLock,
            other => stagehand_core::Error::Internal(other.to_string()),
        }
    }
}
