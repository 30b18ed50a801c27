//! Error types for Stagehand.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    /// The row changed since the caller last read it. Reload and retry, or
    /// abandon; never blindly repeat the same write.
    #[error("optimistic lock error")]
    OptimisticLock,

    /// A long-poll ran out of time without a result.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("cancelled")]
    Cancelled,

    #[error("queue is full ({0} items)")]
    QueueFull(usize),

    #[error("not supported")]
    NotSupported,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("{}", join(.0))]
    Multiple(Vec<Error>),
}

impl Error {
    pub fn is_optimistic_lock(&self) -> bool {
        matches!(self, Error::OptimisticLock)
    }

    /// Deadline and cancellation are the expected outcomes of a long-poll.
    pub fn is_deadline(&self) -> bool {
        matches!(self, Error::DeadlineExceeded | Error::Cancelled)
    }

    /// Collapse accumulated errors: none is success, one is itself.
    pub fn from_many(mut errors: Vec<Error>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Multiple(errors)),
        }
    }
}

fn join(errors: &[Error]) -> String {
    let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
    format!("{} errors occurred: {}", errors.len(), messages.join("; "))
}

pub type Result<T> = std::result::Result<T, Error>;
