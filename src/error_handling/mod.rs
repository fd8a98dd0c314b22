//! Error handling and retry statistics.
//!
//! This module provides:
//! - The classified cluster failure hierarchy (`ClusterError`, `ErrorKind`)
//! - The crate-level `Error`
//! - Retriability (`Retriable`)
//! - Retry counters (`RetryStats`)
//!
//! Failures fall into four groups:
//! - **Transient infrastructure**: absorbed by the two retry layers
//! - **Caller errors**: returned immediately, never retried
//! - **Encoding problems** in fetched bytes: sanitized and logged
//! - **Capability gaps**: `Error::NotSupported`

mod categorization;
mod stats;
mod types;

// Re-export public API
pub use categorization::{categorize_error, Retriable};
pub use stats::RetryStats;
pub use types::{ClusterError, Error, ErrorKind, InitializationError};
