//! Statement retry policy.
//!
//! Consulted when a single statement comes back with a read timeout, a write
//! timeout or an unavailable error: by the driver's per-statement retry hook
//! on a real cluster, by `Session` on the in-process backends. This is the inner retry
//! layer; the Retry Executor sits above it and retries whole operations.

use std::time::Duration;

use rand::Rng;

use crate::cluster::{Consistency, Statement, WriteType};
use crate::config::StatementRetryConfig;

/// What the session does with a failed statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait `delay`, then execute again at `consistency`.
    Retry {
        consistency: Consistency,
        delay: Duration,
    },
    /// Give up and surface the error.
    Rethrow,
}

/// Decides whether a statement that failed at the replica level is attempted again.
///
/// `retries` counts the retries already made for this statement, starting at 0.
pub trait StatementRetryPolicy: std::fmt::Debug + Send + Sync {
    fn read_timeout(
        &self,
        statement: &Statement,
        consistency: Consistency,
        required: u32,
        received: u32,
        data_retrieved: bool,
        retries: u32,
    ) -> RetryDecision;

    fn write_timeout(
        &self,
        statement: &Statement,
        consistency: Consistency,
        write_type: WriteType,
        required: u32,
        received: u32,
        retries: u32,
    ) -> RetryDecision;

    fn unavailable(
        &self,
        statement: &Statement,
        consistency: Consistency,
        required: u32,
        alive: u32,
        retries: u32,
    ) -> RetryDecision;
}

/// Retries at the same consistency with a growing, jittered delay.
///
/// The delay before retry `n` is `n * step + random(0, jitter)`; once
/// `retries` reaches `max_retries` the error is rethrown. A read timeout whose
/// replicas did return data is rethrown straight away.
#[derive(Debug, Clone, Default)]
pub struct DefaultRetryPolicy {
    config: StatementRetryConfig,
}

impl DefaultRetryPolicy {
    pub fn new(config: StatementRetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StatementRetryConfig {
        &self.config
    }

    fn delay(&self, retries: u32) -> Duration {
        let jitter_nanos = u64::try_from(self.config.jitter.as_nanos()).unwrap_or(u64::MAX);
        let jitter = Duration::from_nanos(rand::rng().random_range(0..=jitter_nanos));
        self.config.step.saturating_mul(retries) + jitter
    }

    fn retry_or_rethrow(&self, consistency: Consistency, retries: u32) -> RetryDecision {
        if retries >= self.config.max_retries {
            return RetryDecision::Rethrow;
        }
        RetryDecision::Retry {
            consistency,
            delay: self.delay(retries),
        }
    }
}

impl StatementRetryPolicy for DefaultRetryPolicy {
    fn read_timeout(
        &self,
        _statement: &Statement,
        consistency: Consistency,
        _required: u32,
        _received: u32,
        data_retrieved: bool,
        retries: u32,
    ) -> RetryDecision {
        if data_retrieved {
            return RetryDecision::Rethrow;
        }
        self.retry_or_rethrow(consistency, retries)
    }

    fn write_timeout(
        &self,
        _statement: &Statement,
        consistency: Consistency,
        _write_type: WriteType,
        _required: u32,
        _received: u32,
        retries: u32,
    ) -> RetryDecision {
        self.retry_or_rethrow(consistency, retries)
    }

    fn unavailable(
        &self,
        _statement: &Statement,
        consistency: Consistency,
        _required: u32,
        _alive: u32,
        retries: u32,
    ) -> RetryDecision {
        self.retry_or_rethrow(consistency, retries)
    }
}

/// Always rethrows; leaves every retry to the executor.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverRetryPolicy;

impl StatementRetryPolicy for NeverRetryPolicy {
    fn read_timeout(
        &self,
        _statement: &Statement,
        _consistency: Consistency,
        _required: u32,
        _received: u32,
        _data_retrieved: bool,
        _retries: u32,
    ) -> RetryDecision {
        RetryDecision::Rethrow
    }

    fn write_timeout(
        &self,
        _statement: &Statement,
        _consistency: Consistency,
        _write_type: WriteType,
        _required: u32,
        _received: u32,
        _retries: u32,
    ) -> RetryDecision {
        RetryDecision::Rethrow
    }

    fn unavailable(
        &self,
        _statement: &Statement,
        _consistency: Consistency,
        _required: u32,
        _alive: u32,
        _retries: u32,
    ) -> RetryDecision {
        RetryDecision::Rethrow
    }
}
