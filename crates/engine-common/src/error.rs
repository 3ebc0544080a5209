//! Error types shared by the engine controller crates
//!
//! Store and archive failures are kept in their own enums so that callers can
//! tell a backend outage apart from a malformed run record.

use thiserror::Error;

/// Errors raised by a durable status store backend
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing service could not be reached or rejected the request
    #[error("store backend error: {message}")]
    Backend {
        /// Description of what failed
        message: String,
    },

    /// A conditional write kept losing to concurrent writers
    #[error("store contention on {key} after {attempts} attempts")]
    Contention {
        /// Key being written
        key: String,
        /// Number of attempts made before giving up
        attempts: u32,
    },
}

impl StoreError {
    /// Create a backend error with the given message
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend {
            message: msg.into(),
        }
    }
}

/// Errors raised by a result archive backend
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// HTTP transport failure
    #[error("archive request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The archive answered with an unexpected status
    #[error("archive returned {status} for {context}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Operation that was attempted
        context: String,
    },

    /// The archive answered with a body we could not interpret
    #[error("malformed archive response: {0}")]
    Malformed(String),
}

/// Main error type for run bookkeeping
#[derive(Debug, Error)]
pub enum Error {
    /// Durable status store failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Result archive failure
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    /// A stored value could not be encoded or decoded
    #[error("encoding error for {key}: {message}")]
    Encoding {
        /// Store key holding the value
        key: String,
        /// Description of what failed
        message: String,
    },

    /// A lifecycle status string that is not recognised
    #[error("unknown run status: {0}")]
    UnknownStatus(String),

    /// The named run has no record in the store
    #[error("run not found: {0}")]
    RunNotFound(String),
}

impl Error {
    /// Create an encoding error for the given key
    pub fn encoding(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Encoding {
            key: key.into(),
            message: msg.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_convert_transparently() {
        let err: Error = StoreError::backend("connection refused").into();
        assert_eq!(err.to_string(), "store backend error: connection refused");
    }

    #[test]
    fn contention_names_key_and_attempts() {
        let err = StoreError::Contention {
            key: "run.U1.status".to_string(),
            attempts: 5,
        };
        assert_eq!(
            err.to_string(),
            "store contention on run.U1.status after 5 attempts"
        );
    }

    #[test]
    fn encoding_error_includes_key() {
        let err = Error::encoding("run.U1.rasActions", "invalid base64");
        assert!(err.to_string().contains("run.U1.rasActions"));
    }
}
