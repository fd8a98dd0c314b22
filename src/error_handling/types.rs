//! Error type definitions.
//!
//! This module defines the cluster failure hierarchy, the crate-level error,
//! and initialization errors.

use log::SetLoggerError;
use strum_macros::EnumIter as EnumIterMacro;
use thiserror::Error;

use crate::cluster::{Consistency, WriteType};

/// Error types for initialization failures.
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)] // All variants end with "Error" by convention
pub enum InitializationError {
    /// Error initializing the logger.
    #[error("Logger initialization error: {0}")]
    LoggerError(#[from] SetLoggerError),

    /// Error opening the storage backend.
    #[error("Backend initialization error: {0}")]
    BackendError(String),
}

/// Classification of a cluster failure.
///
/// The first nine kinds are transient infrastructure trouble and are retried
/// by the Retry Executor; the remaining four mean the request itself is wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIterMacro)]
pub enum ErrorKind {
    Execution,
    ReadTimeout,
    WriteTimeout,
    Unavailable,
    Io,
    Internal,
    NoHostsAvailable,
    Server,
    Timeout,
    Client,
    Encoding,
    Decoding,
    Validation,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Execution => "execution error",
            ErrorKind::ReadTimeout => "read timeout",
            ErrorKind::WriteTimeout => "write timeout",
            ErrorKind::Unavailable => "unavailable replicas",
            ErrorKind::Io => "I/O error",
            ErrorKind::Internal => "internal error",
            ErrorKind::NoHostsAvailable => "no hosts available",
            ErrorKind::Server => "server error",
            ErrorKind::Timeout => "statement timeout",
            ErrorKind::Client => "client error",
            ErrorKind::Encoding => "encoding error",
            ErrorKind::Decoding => "decoding error",
            ErrorKind::Validation => "validation error",
        }
    }

    /// Whether failures of this kind may succeed when attempted again.
    pub fn is_retriable(&self) -> bool {
        !matches!(
            self,
            ErrorKind::Client | ErrorKind::Encoding | ErrorKind::Decoding | ErrorKind::Validation
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure reported by the cluster session or one of its connections.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClusterError {
    /// The coordinator failed to execute the statement.
    #[error("execution failed: {0}")]
    Execution(String),

    /// Not enough replicas answered a read in time.
    #[error("read timed out at {consistency} ({received}/{required} responses, data retrieved: {data_retrieved})")]
    ReadTimeout {
        consistency: Consistency,
        required: u32,
        received: u32,
        data_retrieved: bool,
    },

    /// Not enough replicas acknowledged a write in time.
    #[error("{write_type} write timed out at {consistency} ({received}/{required} acknowledgements)")]
    WriteTimeout {
        consistency: Consistency,
        write_type: WriteType,
        required: u32,
        received: u32,
    },

    /// Too few replicas were alive to attempt the statement.
    #[error("unavailable at {consistency} ({alive}/{required} replicas alive)")]
    Unavailable {
        consistency: Consistency,
        required: u32,
        alive: u32,
    },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("no hosts available: {0}")]
    NoHostsAvailable(String),

    #[error("server error: {0}")]
    Server(String),

    #[error("statement timed out: {0}")]
    Timeout(String),

    /// The request was malformed before it reached the cluster.
    #[error("client error: {0}")]
    Client(String),

    /// A bound value does not match the column type.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// A result value could not be decoded.
    #[error("decoding error: {0}")]
    Decoding(String),

    /// The cluster rejected the statement (unknown table, bad syntax, ...).
    #[error("validation error: {0}")]
    Validation(String),
}

impl ClusterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClusterError::Execution(_) => ErrorKind::Execution,
            ClusterError::ReadTimeout { .. } => ErrorKind::ReadTimeout,
            ClusterError::WriteTimeout { .. } => ErrorKind::WriteTimeout,
            ClusterError::Unavailable { .. } => ErrorKind::Unavailable,
            ClusterError::Io(_) => ErrorKind::Io,
            ClusterError::Internal(_) => ErrorKind::Internal,
            ClusterError::NoHostsAvailable(_) => ErrorKind::NoHostsAvailable,
            ClusterError::Server(_) => ErrorKind::Server,
            ClusterError::Timeout(_) => ErrorKind::Timeout,
            ClusterError::Client(_) => ErrorKind::Client,
            ClusterError::Encoding(_) => ErrorKind::Encoding,
            ClusterError::Decoding(_) => ErrorKind::Decoding,
            ClusterError::Validation(_) => ErrorKind::Validation,
        }
    }
}

/// Crate-level error returned by queue, store and schema operations.
///
/// Transient cluster trouble that outlasts every retry never shows up here:
/// writes report "not confirmed" and reads come back empty. What does show up
/// is caller error, capability gaps, corrupt stored data, and cluster
/// failures the executor refuses to retry.
#[derive(Error, Debug)]
pub enum Error {
    /// A cluster failure that was not retried (or a retriable one surfaced
    /// outside the executor).
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// The envelope is not a JSON object.
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// A required envelope or document field is missing or blank.
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    /// `pop` was asked for zero entries.
    #[error("invalid limit value: must be an integer greater than 0 (got {0})")]
    InvalidLimit(usize),

    /// The configuration cannot be honored.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The document locator is not a URL.
    #[error("invalid locator `{locator}`: {source}")]
    InvalidLocator {
        locator: String,
        #[source]
        source: url::ParseError,
    },

    /// The operation is disabled for this backend or layout.
    #[error("{0} not supported")]
    NotSupported(&'static str),

    /// Compressing or decompressing a stored page failed.
    #[error("page codec error: {0}")]
    Codec(#[from] std::io::Error),

    /// JSON encoding or decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether this is the capability-gap signal.
    pub fn is_not_supported(&self) -> bool {
        matches!(self, Error::NotSupported(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_error_kind_as_str_is_unique() {
        let mut seen = std::collections::HashSet::new();
        for kind in ErrorKind::iter() {
            assert!(seen.insert(kind.as_str()), "duplicate label for {kind:?}");
        }
    }

    #[test]
    fn test_retriable_kinds() {
        let retriable: Vec<ErrorKind> = ErrorKind::iter().filter(|k| k.is_retriable()).collect();
        assert_eq!(
            retriable,
            vec![
                ErrorKind::Execution,
                ErrorKind::ReadTimeout,
                ErrorKind::WriteTimeout,
                ErrorKind::Unavailable,
                ErrorKind::Io,
                ErrorKind::Internal,
                ErrorKind::NoHostsAvailable,
                ErrorKind::Server,
                ErrorKind::Timeout,
            ]
        );
    }

    #[test]
    fn test_cluster_error_kind_mapping() {
        assert_eq!(
            ClusterError::NoHostsAvailable("all down".into()).kind(),
            ErrorKind::NoHostsAvailable
        );
        assert_eq!(
            ClusterError::Unavailable {
                consistency: Consistency::Quorum,
                required: 2,
                alive: 1
            }
            .kind(),
            ErrorKind::Unavailable
        );
        assert_eq!(
            ClusterError::Validation("unconfigured table".into()).kind(),
            ErrorKind::Validation
        );
    }

    #[test]
    fn test_write_timeout_display() {
        let err = ClusterError::WriteTimeout {
            consistency: Consistency::One,
            write_type: WriteType::Simple,
            required: 1,
            received: 0,
        };
        assert_eq!(
            err.to_string(),
            "SIMPLE write timed out at ONE (0/1 acknowledgements)"
        );
    }

    #[test]
    fn test_invalid_limit_message() {
        assert_eq!(
            Error::InvalidLimit(0).to_string(),
            "invalid limit value: must be an integer greater than 0 (got 0)"
        );
    }

    #[test]
    fn test_not_supported_message() {
        let err = Error::NotSupported("count");
        assert!(err.is_not_supported());
        assert_eq!(err.to_string(), "count not supported");
    }
}
