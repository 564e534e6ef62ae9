//! Error types for certificate rotation

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for certificate rotation operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Invalid rotator configuration (bad validity/refresh, empty hostnames, ...)
    #[error("configuration error: {0}")]
    Config(String),

    /// Key generation, signing, or encoding failure
    #[error("crypto error: {0}")]
    Crypto(String),

    /// A persisted artifact could not be parsed
    #[error("parse error: {0}")]
    Parse(String),

    /// Object store error (not-found, conflict, forbidden, transport)
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Several leaf rotators failed in one activation
    #[error("{} errors occurred: [{}]", .0.len(), join_errors(.0))]
    Aggregate(Vec<Error>),
}

impl Error {
    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a crypto error with the given message
    pub fn crypto(msg: impl Into<String>) -> Self {
        Self::Crypto(msg.into())
    }

    /// Create a parse error with the given message
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    /// Fold a list of errors into a single result.
    ///
    /// Empty list means success; a single error is returned as-is; more than
    /// one is wrapped in [`Error::Aggregate`].
    pub fn aggregate(mut errors: Vec<Error>) -> crate::Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Aggregate(errors)),
        }
    }

    /// Whether the next activation may succeed without a spec change.
    ///
    /// Configuration errors require user intervention; everything else is
    /// worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Config(_) => false,
            Error::Store(err) => err.is_retryable(),
            Error::Aggregate(errors) => errors.iter().any(Error::is_retryable),
            _ => true,
        }
    }
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
