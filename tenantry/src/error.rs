//! Crate-level error type
//!
//! Repository calls return [`RepositoryError`](crate::repository::RepositoryError)
//! directly. [`Error`] wraps it together with the failures of the ambient
//! layers (configuration, connection setup, tracing) for callers that drive
//! the whole stack, such as the CLI.

use thiserror::Error;

use crate::repository::{RepositoryError, RepositoryErrorKind};

/// Result type alias using the crate error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the crate
///
/// Large error variants are boxed to reduce stack size
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),

    /// Repository operation failed
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    /// Database driver error outside a repository call
    #[cfg(feature = "postgres")]
    #[error("Database error: {0}")]
    Database(Box<sqlx::Error>),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether retrying the same call may succeed
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::Repository(err) => err.is_retriable(),
            #[cfg(feature = "postgres")]
            Error::Database(err) => matches!(
                err.as_ref(),
                sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed
            ),
            _ => false,
        }
    }

    /// The repository error kind, when this wraps one
    pub fn repository_kind(&self) -> Option<RepositoryErrorKind> {
        match self {
            Error::Repository(err) => Some(err.kind),
            _ => None,
        }
    }
}

// Manual From implementations for boxed errors
impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Box::new(err))
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Database(Box::new(err))
    }
}
