//! Configuration constants.
//!
//! This module defines the defaults used throughout the crate: retry bounds,
//! backoff windows, schema defaults and scan sizes.

use std::time::Duration;

// Operation-level retry (Retry Executor)
/// Maximum number of attempts per operation (initial attempt included).
/// Set to 3 = initial attempt + 2 retries.
pub const RETRY_MAX_ATTEMPTS: u32 = 3;
/// Lower bound of the jitter multiplier, in seconds per attempt.
/// The delay before retry `i` is `i * random(RETRY_JITTER_MIN_SECS, RETRY_JITTER_MAX_SECS)`.
pub const RETRY_JITTER_MIN_SECS: f64 = 1.5;
/// Upper bound of the jitter multiplier, in seconds per attempt.
pub const RETRY_JITTER_MAX_SECS: f64 = 2.5;

// Statement-level retry (Statement Retry Policy)
/// Retry counter value at which the statement policy gives up.
pub const STATEMENT_MAX_RETRIES: u32 = 5;
/// Delay added per previous statement retry.
pub const STATEMENT_RETRY_STEP: Duration = Duration::from_secs(1);
/// Upper bound of the random component added to each statement retry delay.
pub const STATEMENT_RETRY_JITTER: Duration = Duration::from_secs(1);

// Schema defaults
/// Replication factor used by the default `SimpleStrategy` replication.
pub const DEFAULT_REPLICATION_FACTOR: u32 = 3;
/// Maximum length of a keyspace or table name.
/// Cassandra rejects identifiers longer than 48 characters.
pub const MAX_IDENTIFIER_LENGTH: usize = 48;

// Scans
/// Rows fetched per page by full-table scans (`DocumentStore::each`).
pub const DEFAULT_PAGE_SIZE: usize = 500;

// Encoding
/// Character substituted for byte sequences that are not valid UTF-8.
pub const REPLACEMENT_CHAR: char = '?';

// Cluster connection
/// Contact point used when none is configured.
pub const DEFAULT_CONTACT_POINT: &str = "127.0.0.1:9042";
/// Client-side limit on a single request, retries by the driver included.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(12);

/// Default SQLite file used by the CLI.
pub const DB_PATH: &str = "./crawl_durability.db";
