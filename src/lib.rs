//! crawl_durability library: durable overflow queue and page store for a crawl pipeline
//!
//! This library keeps two pieces of crawler state on a partitioned key/value
//! cluster and makes ordinary CRUD on them survive transient cluster trouble:
//! an overflow queue that absorbs surplus work entries oldest-first, and a
//! compressed document store keyed by a digest of the page locator.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use crawl_durability::cluster::{ScyllaCluster, Session};
//! use crawl_durability::queue::{build_queue, QueueOverflow};
//! use crawl_durability::{ClusterConfig, QueueConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ClusterConfig::default();
//! let cluster = ScyllaCluster::connect(&config).await?;
//! let session = Arc::new(Session::with_config(Arc::new(cluster), &config));
//!
//! let queue = build_queue(&QueueConfig::default(), session)?;
//! queue.ensure_schema().await?;
//! queue.push(Some(r#"{"payload":{"url":"http://example.com/","depth":1}}"#)).await?;
//! let next = queue.pop(1).await?;
//! println!("{next:?}");
//! # Ok(())
//! # }
//! ```
//!
//! # Requirements
//!
//! Every cluster call is async. Use `#[tokio::main]` in your application or
//! call library functions from within a Tokio runtime.

pub mod cluster;
pub mod config;
pub mod error_handling;
pub mod initialization;
pub mod queue;
pub mod retry;
pub mod schema;
pub mod store;
pub mod utils;

// Re-export public API
pub use config::{
    ClusterConfig, IdOptions, LogFormat, LogLevel, QueueBackend, QueueConfig, QueueLayout,
    Replication, RetryConfig, StatementRetryConfig, StoreConfig, StoreLayout,
};
pub use error_handling::{ClusterError, Error, ErrorKind};
pub use queue::{build_queue, Popped, QueueOverflow, QueueToken};
pub use retry::RetryExecutor;
pub use store::{Document, DocumentStore};
