//! Configuration and constants.
//!
//! This module provides:
//! - Configuration constants (retry bounds, schema defaults, scan sizes)
//! - Queue, store and retry configuration types
//! - Logging options shared with the CLI

mod constants;
mod types;

// Re-export all constants
pub use constants::*;
pub use types::{
    ClusterConfig, IdOptions, LogFormat, LogLevel, QueueBackend, QueueConfig, QueueLayout,
    Replication, RetryConfig, StatementRetryConfig, StoreConfig, StoreLayout,
};
