//! Error retriability.
//!
//! The Retry Executor only needs to know whether a failure might succeed on
//! another attempt. Everything that is not a transient cluster failure is
//! treated as a caller bug and surfaces immediately.

use super::types::{ClusterError, Error, ErrorKind};

/// Failures that know whether another attempt could help.
pub trait Retriable {
    /// Returns `true` when the failure is transient infrastructure trouble.
    fn is_retriable(&self) -> bool;

    /// The cluster failure kind, used for retry statistics.
    fn error_kind(&self) -> Option<ErrorKind> {
        None
    }
}

impl Retriable for ClusterError {
    fn is_retriable(&self) -> bool {
        self.kind().is_retriable()
    }

    fn error_kind(&self) -> Option<ErrorKind> {
        Some(self.kind())
    }
}

impl Retriable for Error {
    fn is_retriable(&self) -> bool {
        match self {
            Error::Cluster(e) => e.is_retriable(),
            _ => false,
        }
    }

    fn error_kind(&self) -> Option<ErrorKind> {
        categorize_error(self)
    }
}

/// Extracts the cluster error kind from a crate error, if it wraps one.
pub fn categorize_error(error: &Error) -> Option<ErrorKind> {
    match error {
        Error::Cluster(e) => Some(e.kind()),
        _ => None,
    }
}
