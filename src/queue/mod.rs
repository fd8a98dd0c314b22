//! Overflow queue.
//!
//! When the crawler's in-memory work queue grows past its bound, surplus
//! entries are pushed here and popped back oldest-first as capacity frees up.
//!
//! This module provides:
//! - The `QueueOverflow` trait every backend implements
//! - `DevNullQueue`, `MemoryQueue` and the durable `ClusterQueue`
//! - `build_queue`, which picks a backend from `QueueConfig`

mod cluster;
mod dev_null;
mod memory;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as Json;

use crate::cluster::{Session, TimeUuid};
use crate::config::{QueueBackend, QueueConfig};
use crate::error_handling::Error;

// Re-export public API
pub use cluster::{ClusterQueue, QUEUE_KEYED, QUEUE_TIME_ORDERED};
pub use dev_null::DevNullQueue;
pub use memory::MemoryQueue;

/// Identifies a pushed entry: queue name plus its time-ordered identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueToken {
    pub queue_name: String,
    pub created_at: TimeUuid,
}

impl fmt::Display for QueueToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.queue_name, self.created_at)
    }
}

/// An entry read back from the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub queue_name: String,
    pub created_at: TimeUuid,
    /// JSON-encoded payload, `None` when the envelope had none.
    pub payload: Option<String>,
    /// Row key for layouts not keyed by `(queue_name, created_at)`.
    pub(crate) id: Option<String>,
}

impl QueueEntry {
    pub(crate) fn new(queue_name: String, created_at: TimeUuid, payload: Option<String>) -> Self {
        Self {
            queue_name,
            created_at,
            payload,
            id: None,
        }
    }

    pub fn token(&self) -> QueueToken {
        QueueToken {
            queue_name: self.queue_name.clone(),
            created_at: self.created_at,
        }
    }
}

/// Result of `pop`.
///
/// A single entry comes back as its bare payload, for callers that pop one
/// item at a time; any other count (zero included) returns the entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Popped {
    One(Option<String>),
    Many(Vec<QueueEntry>),
}

impl Popped {
    pub(crate) fn from_entries(mut entries: Vec<QueueEntry>) -> Self {
        if entries.len() == 1 {
            let entry = entries.remove(0);
            Popped::One(entry.payload)
        } else {
            Popped::Many(entries)
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Popped::One(_) => 1,
            Popped::Many(entries) => entries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw JSON payloads in pop order.
    pub fn into_payloads(self) -> Vec<Option<String>> {
        match self {
            Popped::One(payload) => vec![payload],
            Popped::Many(entries) => entries.into_iter().map(|e| e.payload).collect(),
        }
    }

    /// Decoded payloads in pop order; a missing payload decodes to `null`.
    pub fn payload_values(&self) -> Result<Vec<Json>, Error> {
        let decode = |payload: &Option<String>| -> Result<Json, Error> {
            match payload {
                Some(text) => Ok(serde_json::from_str(text)?),
                None => Ok(Json::Null),
            }
        };
        match self {
            Popped::One(payload) => Ok(vec![decode(payload)?]),
            Popped::Many(entries) => entries.iter().map(|e| decode(&e.payload)).collect(),
        }
    }
}

/// What a queue backend can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// `length` returns a number instead of `NotSupported`.
    pub count: bool,
    /// Entries survive the process.
    pub durable: bool,
    /// `pop` returns entries oldest first.
    pub ordered: bool,
}

/// The overflow queue contract shared by every backend.
#[async_trait]
pub trait QueueOverflow: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    /// Creates whatever storage the backend needs. Idempotent.
    async fn ensure_schema(&self) -> Result<bool, Error> {
        Ok(true)
    }

    /// Number of queued entries; `Ok(None)` when the count was not confirmed.
    async fn length(&self) -> Result<Option<u64>, Error>;

    /// Whether nothing is queued. An unconfirmed read reports empty.
    async fn is_empty(&self) -> Result<bool, Error>;

    /// Drops every entry. Returns whether the backend confirmed it.
    async fn clear(&self) -> Result<bool, Error>;

    /// Queues the payload of a JSON envelope.
    ///
    /// `None` is a no-op returning `Ok(None)`. A write that was not confirmed
    /// also returns `Ok(None)`.
    async fn push(&self, envelope: Option<&str>) -> Result<Option<QueueToken>, Error>;

    /// Removes and returns up to `n` of the oldest entries. `n` must be positive.
    async fn pop(&self, n: usize) -> Result<Popped, Error>;
}

/// Extracts the payload of a push envelope as JSON text.
///
/// The envelope must be a JSON object. A missing, `null` or empty payload
/// (empty string, array or object) is stored as no payload.
pub(crate) fn encode_payload(envelope: &str) -> Result<Option<String>, Error> {
    let parsed: Json = serde_json::from_str(envelope)
        .map_err(|e| Error::InvalidEnvelope(format!("not valid JSON: {e}")))?;
    let Json::Object(mut fields) = parsed else {
        return Err(Error::InvalidEnvelope(
            "expected a JSON object".to_string(),
        ));
    };
    let payload = match fields.remove("payload") {
        None | Some(Json::Null) => None,
        Some(Json::String(s)) if s.is_empty() => None,
        Some(Json::Array(a)) if a.is_empty() => None,
        Some(Json::Object(o)) if o.is_empty() => None,
        Some(value) => Some(serde_json::to_string(&value)?),
    };
    Ok(payload)
}

pub(crate) fn check_limit(n: usize) -> Result<(), Error> {
    if n == 0 {
        return Err(Error::InvalidLimit(n));
    }
    Ok(())
}

/// Builds the backend selected by `config.backend`.
///
/// The session is only used by the cluster backend.
pub fn build_queue(
    config: &QueueConfig,
    session: Arc<Session>,
) -> Result<Box<dyn QueueOverflow>, Error> {
    let queue: Box<dyn QueueOverflow> = match config.backend {
        QueueBackend::DevNull => Box::new(DevNullQueue::new()),
        QueueBackend::Memory => Box::new(MemoryQueue::new(config)?),
        QueueBackend::Cluster => Box::new(ClusterQueue::new(session, config)?),
    };
    log::debug!("built {:?} overflow queue", config.backend);
    Ok(queue)
}
