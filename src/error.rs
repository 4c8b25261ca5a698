use crate::types::Abort;
use thiserror::Error;

/// Errors that can occur when interacting with the multi-version store.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// A read depended on a transaction whose write is being re-executed.
    #[error("read estimate written by transaction {}", .0.dependent)]
    Estimate(Abort),
    #[error("key must not be empty")]
    EmptyKey,
    #[error("storage error: {0}")]
    Storage(String),
    #[error("failed to build thread pool: {0}")]
    ThreadPool(String),
}

impl Error {
    /// Returns the abort carried by an estimate read, if any.
    pub fn abort(&self) -> Option<Abort> {
        match self {
            Error::Estimate(abort) => Some(*abort),
            _ => None,
        }
    }
}

impl From<Abort> for Error {
    fn from(abort: Abort) -> Self {
        Error::Estimate(abort)
    }
}
