//! Configuration types.
//!
//! Plain structs with `Default` impls; callers build them programmatically or
//! via the CLI in `main.rs`. Nothing in here talks to the cluster.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use clap::ValueEnum;

use crate::cluster::Consistency;
use crate::config::constants::{
    DEFAULT_CONTACT_POINT, DEFAULT_PAGE_SIZE, DEFAULT_REQUEST_TIMEOUT, DEFAULT_REPLICATION_FACTOR, RETRY_JITTER_MAX_SECS, RETRY_JITTER_MIN_SECS,
    RETRY_MAX_ATTEMPTS, STATEMENT_MAX_RETRIES, STATEMENT_RETRY_JITTER, STATEMENT_RETRY_STEP,
};
use crate::error_handling::Error;

/// Logging level for the application.
///
/// Controls the verbosity of log output, from most restrictive (Error) to most
/// verbose (Trace).
#[derive(Clone, Debug, ValueEnum)]
pub enum LogLevel {
    /// Only error messages
    Error,
    /// Error and warning messages
    Warn,
    /// Error, warning, and informational messages
    Info,
    /// All messages except trace
    Debug,
    /// All messages including trace
    Trace,
}

impl From<LogLevel> for log::LevelFilter {
    fn from(l: LogLevel) -> Self {
        match l {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

/// Log output format.
///
/// - `Plain`: Human-readable format with colors (default)
/// - `Json`: Structured JSON format for machine parsing
#[derive(Clone, Debug, ValueEnum)]
pub enum LogFormat {
    /// Human-readable format with colors (default)
    Plain,
    /// Structured JSON format for machine parsing
    Json,
}

/// Keyspace replication settings rendered into `CREATE KEYSPACE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Replication {
    /// `SimpleStrategy` with a single replication factor.
    Simple { replication_factor: u32 },
    /// `NetworkTopologyStrategy` with a factor per datacenter.
    NetworkTopology(BTreeMap<String, u32>),
    /// A replication map written verbatim, e.g. `{'class': 'SimpleStrategy', 'replication_factor': '1'}`.
    Raw(String),
}

impl Default for Replication {
    fn default() -> Self {
        Replication::Simple {
            replication_factor: DEFAULT_REPLICATION_FACTOR,
        }
    }
}

impl fmt::Display for Replication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Replication::Simple { replication_factor } => write!(
                f,
                "{{'class': 'SimpleStrategy', 'replication_factor': '{replication_factor}'}}"
            ),
            Replication::NetworkTopology(datacenters) => {
                f.write_str("{'class': 'NetworkTopologyStrategy'")?;
                for (dc, factor) in datacenters {
                    write!(f, ", '{dc}': '{factor}'")?;
                }
                f.write_str("}")
            }
            Replication::Raw(raw) => f.write_str(raw),
        }
    }
}

/// Operation-level retry settings (the Retry Executor).
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts, initial attempt included. Must be at least 1.
    pub max_attempts: u32,
    /// Lower bound of the per-attempt jitter multiplier, in seconds.
    pub jitter_min_secs: f64,
    /// Upper bound of the per-attempt jitter multiplier, in seconds.
    pub jitter_max_secs: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: RETRY_MAX_ATTEMPTS,
            jitter_min_secs: RETRY_JITTER_MIN_SECS,
            jitter_max_secs: RETRY_JITTER_MAX_SECS,
        }
    }
}

impl RetryConfig {
    /// A configuration that retries without sleeping. Handy for tests and
    /// for callers that impose their own pacing.
    pub fn without_backoff(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            jitter_min_secs: 0.0,
            jitter_max_secs: 0.0,
        }
    }

    /// Rejects configurations the executor cannot honor.
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_attempts == 0 {
            return Err(Error::InvalidConfig(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if !self.jitter_min_secs.is_finite()
            || !self.jitter_max_secs.is_finite()
            || self.jitter_min_secs < 0.0
            || self.jitter_min_secs > self.jitter_max_secs
        {
            return Err(Error::InvalidConfig(format!(
                "invalid jitter window [{}, {}]",
                self.jitter_min_secs, self.jitter_max_secs
            )));
        }
        Ok(())
    }
}

/// Statement-level retry settings (the Statement Retry Policy).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementRetryConfig {
    /// Retry counter value at which the policy gives up.
    pub max_retries: u32,
    /// Delay added per previous retry.
    pub step: Duration,
    /// Upper bound of the random delay component.
    pub jitter: Duration,
}

impl Default for StatementRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: STATEMENT_MAX_RETRIES,
            step: STATEMENT_RETRY_STEP,
            jitter: STATEMENT_RETRY_JITTER,
        }
    }
}

/// Connection settings for a Cassandra or ScyllaDB cluster.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Contact points as `host:port`.
    pub hosts: Vec<String>,
    /// Consistency every statement starts at.
    pub consistency: Consistency,
    /// Per-request timeout; `None` waits indefinitely.
    pub request_timeout: Option<Duration>,
    /// Settings for the statement retry policy registered with the driver.
    pub statement_retry: StatementRetryConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            hosts: vec![DEFAULT_CONTACT_POINT.to_string()],
            consistency: Consistency::default(),
            request_timeout: Some(DEFAULT_REQUEST_TIMEOUT),
            statement_retry: StatementRetryConfig::default(),
        }
    }
}

impl ClusterConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.hosts.iter().all(|host| host.trim().is_empty()) {
            return Err(Error::InvalidConfig(
                "at least one contact point is required".to_string(),
            ));
        }
        Ok(())
    }
}

/// How the document identifier is derived from a locator.
///
/// Fixed per store instance. Changing it does not rehash rows already
/// written, so two instances with different options see the same resource
/// under two identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdOptions {
    /// Whether the query string participates in the digest.
    pub include_query_string: bool,
    /// Whether `https` is folded to `http` before hashing.
    pub fold_secure_scheme: bool,
}

impl Default for IdOptions {
    fn default() -> Self {
        Self {
            include_query_string: true,
            fold_secure_scheme: true,
        }
    }
}

/// Which queue implementation `build_queue` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum QueueBackend {
    /// Accepts and drops everything.
    DevNull,
    /// Process-local FIFO; lost on exit.
    Memory,
    /// Durable queue on the cluster.
    #[default]
    Cluster,
}

/// Table layout of a cluster-backed queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum QueueLayout {
    /// `(queue_name, created_at, payload)`, clustered by `created_at`.
    /// Pops are oldest-first within a queue name.
    #[default]
    TimeOrdered,
    /// Legacy `(id, created_at, payload)` keyed by entry id. Every entry is
    /// its own partition, so pops come back in token order, not arrival order.
    Keyed,
}

/// Table layout of the document store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum StoreLayout {
    /// `(id, page)` only.
    Compact,
    /// `(id, page)` plus flattened metadata columns.
    #[default]
    Rich,
}

/// Overflow queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Keyspace holding the queue table (normalized on use).
    pub keyspace: String,
    /// Queue table name (normalized on use).
    pub table: String,
    /// Partition key value. Defaults to the normalized keyspace name.
    pub queue_name: Option<String>,
    /// Implementation selected by `build_queue`.
    pub backend: QueueBackend,
    /// Table layout for the cluster backend.
    pub layout: QueueLayout,
    /// Replication used by `create_keyspace`.
    pub replication: Replication,
    /// Operation-level retry settings.
    pub retry: RetryConfig,
    /// Whether `length` may run a full `COUNT(*)`.
    pub count_supported: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            keyspace: "crawl_queue_overflow".to_string(),
            table: "queue_overflow".to_string(),
            queue_name: None,
            backend: QueueBackend::default(),
            layout: QueueLayout::default(),
            replication: Replication::default(),
            retry: RetryConfig::default(),
            count_supported: true,
        }
    }
}

/// Document store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Keyspace holding the page table (normalized on use).
    pub keyspace: String,
    /// Page table name (normalized on use).
    pub table: String,
    /// Document fields left out of the stored record.
    pub except: Vec<String>,
    /// Table layout.
    pub layout: StoreLayout,
    /// Replication used by `create_keyspace`.
    pub replication: Replication,
    /// Operation-level retry settings.
    pub retry: RetryConfig,
    /// Whether `count` may run a full `COUNT(*)`.
    pub count_supported: bool,
    /// Rows per page for `each`.
    pub page_size: usize,
    /// Identifier derivation.
    pub id: IdOptions,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            keyspace: "crawl_pages".to_string(),
            table: "pages".to_string(),
            except: Vec::new(),
            layout: StoreLayout::default(),
            replication: Replication::default(),
            retry: RetryConfig::default(),
            count_supported: true,
            page_size: DEFAULT_PAGE_SIZE,
            id: IdOptions::default(),
        }
    }
}
