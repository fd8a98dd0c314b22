// Shared test helpers for cluster setup and test data creation.
//
// This module provides common utilities used across multiple test files to reduce duplication.

use std::path::Path;
use std::sync::Arc;

use crawl_durability::cluster::{MemoryCluster, Session, SqliteCluster};
use crawl_durability::{Document, QueueConfig, RetryConfig, StoreConfig};

/// Attempts per operation in tests. Backoff is disabled so retries are instant.
#[allow(dead_code)] // Used by other test files
pub const TEST_ATTEMPTS: u32 = 3;

/// Creates an in-process cluster and a session over it.
/// The cluster handle is returned so tests can inject faults and count calls.
#[allow(dead_code)] // Used by other test files
pub fn memory_session() -> (Arc<MemoryCluster>, Arc<Session>) {
    let cluster = Arc::new(MemoryCluster::new());
    let session = Arc::new(Session::new(cluster.clone()));
    (cluster, session)
}

/// Creates a session over a private in-memory SQLite database.
#[allow(dead_code)] // Used by other test files
pub async fn sqlite_session() -> Arc<Session> {
    let cluster = SqliteCluster::in_memory()
        .await
        .expect("Failed to create in-memory SQLite cluster");
    Arc::new(Session::new(Arc::new(cluster)))
}

/// Creates a session over a SQLite file.
/// If the database file already exists, it will be reused (not truncated).
#[allow(dead_code)] // Used by other test files
pub async fn sqlite_session_at(path: &Path) -> Arc<Session> {
    let cluster = SqliteCluster::open(path)
        .await
        .expect("Failed to open SQLite cluster");
    Arc::new(Session::new(Arc::new(cluster)))
}

/// Queue configuration with instant retries.
#[allow(dead_code)] // Used by other test files
pub fn queue_config(keyspace: &str) -> QueueConfig {
    QueueConfig {
        keyspace: keyspace.to_string(),
        retry: RetryConfig::without_backoff(TEST_ATTEMPTS),
        ..QueueConfig::default()
    }
}

/// Store configuration with instant retries.
#[allow(dead_code)] // Used by other test files
pub fn store_config(keyspace: &str) -> StoreConfig {
    StoreConfig {
        keyspace: keyspace.to_string(),
        retry: RetryConfig::without_backoff(TEST_ATTEMPTS),
        ..StoreConfig::default()
    }
}

/// Builds a fetched page the way the crawler would hand it over.
#[allow(dead_code)] // Used by other test files
pub fn page_factory(url: &str) -> Document {
    let mut doc = Document::new(url);
    doc.code = 200;
    doc.depth = 1;
    doc.fetched = true;
    doc.response_time = Some(1313);
    doc.set_body_bytes(b"<html></html>");
    doc.insert_header_bytes("Content-Type", b"text/html");
    doc.links = vec![format!("{url}/about")];
    doc
}

/// Wraps `payload` in a push envelope.
#[allow(dead_code)] // Used by other test files
pub fn envelope(payload: serde_json::Value) -> String {
    serde_json::json!({ "payload": payload }).to_string()
}
