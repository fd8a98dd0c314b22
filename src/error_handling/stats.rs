//! Retry statistics tracking.
//!
//! Thread-safe counters fed by the Retry Executor: how many attempts ran,
//! which failure kinds were retried, and how many operations gave up.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use strum::IntoEnumIterator;

use super::types::ErrorKind;

/// Thread-safe retry statistics tracker.
///
/// All error kinds are initialized to zero on creation, so lookups never miss.
/// Share across tasks with `Arc`.
pub struct RetryStats {
    attempts: AtomicUsize,
    retries: HashMap<ErrorKind, AtomicUsize>,
    exhausted: AtomicUsize,
    fatal: AtomicUsize,
}

impl RetryStats {
    pub fn new() -> Self {
        let mut retries = HashMap::new();
        for kind in ErrorKind::iter() {
            retries.insert(kind, AtomicUsize::new(0));
        }

        RetryStats {
            attempts: AtomicUsize::new(0),
            retries,
            exhausted: AtomicUsize::new(0),
            fatal: AtomicUsize::new(0),
        }
    }

    pub fn record_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a failed attempt of the given kind that will be retried.
    pub fn record_retry(&self, kind: ErrorKind) {
        if let Some(counter) = self.retries.get(&kind) {
            counter.fetch_add(1, Ordering::Relaxed);
        } else {
            log::error!(
                "Attempted to increment retry counter for {:?} which is not in the map. \
                 This indicates a bug in RetryStats initialization.",
                kind
            );
        }
    }

    /// Records an operation that ran out of attempts.
    pub fn record_exhausted(&self) {
        self.exhausted.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an operation that failed with a non-retriable error.
    pub fn record_fatal(&self) {
        self.fatal.fetch_add(1, Ordering::Relaxed);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn retries(&self, kind: ErrorKind) -> usize {
        self.retries
            .get(&kind)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn total_retries(&self) -> usize {
        self.retries.values().map(|c| c.load(Ordering::SeqCst)).sum()
    }

    pub fn exhausted(&self) -> usize {
        self.exhausted.load(Ordering::SeqCst)
    }

    pub fn fatal(&self) -> usize {
        self.fatal.load(Ordering::SeqCst)
    }
}

impl Default for RetryStats {
    fn default() -> Self {
        Self::new()
    }
}
