//! Retry Executor: operation-level retries with jittered backoff.
//!
//! Every queue and store operation funnels its cluster calls through
//! [`RetryExecutor::run`]. A transient failure is retried after
//! `attempt * random(min, max)` seconds; a caller error surfaces immediately;
//! running out of attempts yields `Ok(None)`, which callers must read as
//! "not confirmed" rather than as success or failure.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_retry::RetryIf;

use crate::config::RetryConfig;
use crate::error_handling::{Error, Retriable, RetryStats};

/// Delay before the next attempt.
///
/// `attempt` is the 1-based index of the attempt that just failed.
pub trait Backoff: Send + Sync {
    fn delay(&self, attempt: u32) -> Duration;
}

/// `attempt * random(min, max)` seconds, with no cap.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JitteredBackoff {
    min_secs: f64,
    max_secs: f64,
}

impl JitteredBackoff {
    pub fn new(min_secs: f64, max_secs: f64) -> Self {
        Self { min_secs, max_secs }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.jitter_min_secs, config.jitter_max_secs)
    }
}

impl Backoff for JitteredBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let factor = if self.max_secs > self.min_secs {
            rand::rng().random_range(self.min_secs..=self.max_secs)
        } else {
            self.min_secs
        };
        Duration::from_secs_f64((attempt as f64 * factor).max(0.0))
    }
}

/// Runs units of work against the cluster, retrying transient failures.
#[derive(Clone)]
pub struct RetryExecutor {
    max_attempts: u32,
    backoff: Arc<dyn Backoff>,
    stats: Arc<RetryStats>,
}

impl std::fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl RetryExecutor {
    /// Builds an executor with [`JitteredBackoff`] from a validated config.
    pub fn new(config: &RetryConfig) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self::with_backoff(
            config.max_attempts,
            Arc::new(JitteredBackoff::from_config(config)),
        ))
    }

    /// Builds an executor with a custom backoff strategy. `max_attempts` is
    /// clamped to at least 1.
    pub fn with_backoff(max_attempts: u32, backoff: Arc<dyn Backoff>) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            stats: Arc::new(RetryStats::new()),
        }
    }

    /// Shares a statistics tracker with other executors.
    pub fn with_stats(mut self, stats: Arc<RetryStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn stats(&self) -> &Arc<RetryStats> {
        &self.stats
    }

    /// Runs `work`, retrying failures for which [`Retriable::is_retriable`] holds.
    pub async fn run<T, E, F, Fut>(&self, label: &str, work: F) -> Result<Option<T>, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retriable + Display,
    {
        self.run_with(label, |e: &E| e.is_retriable(), work).await
    }

    /// Runs `work`, retrying failures for which `classify` returns `true`.
    ///
    /// Returns `Ok(Some(value))` on success, `Ok(None)` once `max_attempts`
    /// attempts have failed with retriable errors, and `Err(e)` as soon as a
    /// failure is classified as not retriable.
    pub async fn run_with<T, E, F, Fut, C>(
        &self,
        label: &str,
        classify: C,
        mut work: F,
    ) -> Result<Option<T>, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retriable + Display,
        C: Fn(&E) -> bool,
    {
        let max_attempts = self.max_attempts;
        let backoff = Arc::clone(&self.backoff);
        // Lazy, so each delay is drawn only when a retry actually happens.
        let strategy = (1..max_attempts).map(move |attempt| backoff.delay(attempt));

        let stats = &self.stats;
        let mut failures = 0u32;

        let result = RetryIf::start(
            strategy,
            || {
                stats.record_attempt();
                work()
            },
            |e: &E| {
                failures += 1;
                let retriable = classify(e);
                if !retriable {
                    return false;
                }
                if failures < max_attempts {
                    if let Some(kind) = e.error_kind() {
                        stats.record_retry(kind);
                    }
                    log::warn!(
                        "{label}: attempt {failures}/{max_attempts} failed, retrying: {e}"
                    );
                }
                true
            },
        )
        .await;

        match result {
            Ok(value) => Ok(Some(value)),
            Err(e) if classify(&e) => {
                stats.record_exhausted();
                log::error!("{label}: giving up after {max_attempts} attempts: {e}");
                Ok(None)
            }
            Err(e) => {
                stats.record_fatal();
                log::debug!("{label}: not retrying: {e}");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use crate::error_handling::{ClusterError, ErrorKind};

    /// Records requested delays and never sleeps.
    #[derive(Default)]
    struct RecordingBackoff {
        attempts: Mutex<Vec<u32>>,
    }

    impl Backoff for RecordingBackoff {
        fn delay(&self, attempt: u32) -> Duration {
            self.attempts.lock().unwrap().push(attempt);
            Duration::ZERO
        }
    }

    fn executor(max_attempts: u32) -> (RetryExecutor, Arc<RecordingBackoff>) {
        let backoff = Arc::new(RecordingBackoff::default());
        let exec = RetryExecutor::with_backoff(max_attempts, backoff.clone());
        (exec, backoff)
    }

    #[tokio::test]
    async fn test_success_returns_immediately() {
        let (exec, backoff) = executor(3);
        let calls = AtomicU32::new(0);
        let result: Result<Option<u32>, ClusterError> = exec
            .run("ok", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(7) }
            })
            .await;
        assert_eq!(result.unwrap(), Some(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(backoff.attempts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retriable_failure_exhausts_to_none() {
        let (exec, backoff) = executor(3);
        let calls = AtomicU32::new(0);
        let result: Result<Option<()>, ClusterError> = exec
            .run("down", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ClusterError::NoHostsAvailable("all down".into())) }
            })
            .await;
        assert_eq!(result.unwrap(), None);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(*backoff.attempts.lock().unwrap(), vec![1, 2]);
        assert_eq!(exec.stats().attempts(), 3);
        assert_eq!(exec.stats().retries(ErrorKind::NoHostsAvailable), 2);
        assert_eq!(exec.stats().exhausted(), 1);
    }

    #[tokio::test]
    async fn test_non_retriable_failure_surfaces_without_sleep() {
        let (exec, backoff) = executor(3);
        let calls = AtomicU32::new(0);
        let result: Result<Option<()>, ClusterError> = exec
            .run("bad", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ClusterError::Validation("unconfigured table".into())) }
            })
            .await;
        assert!(matches!(result, Err(ClusterError::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(backoff.attempts.lock().unwrap().is_empty());
        assert_eq!(exec.stats().fatal(), 1);
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failure() {
        let (exec, backoff) = executor(3);
        let calls = AtomicU32::new(0);
        let result: Result<Option<&str>, ClusterError> = exec
            .run("flaky", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(ClusterError::Timeout("slow".into()))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), Some("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(*backoff.attempts.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_single_attempt_never_sleeps() {
        let (exec, backoff) = executor(1);
        let result: Result<Option<()>, ClusterError> = exec
            .run("once", || async { Err(ClusterError::Io("reset".into())) })
            .await;
        assert_eq!(result.unwrap(), None);
        assert!(backoff.attempts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_custom_classifier_overrides_retriability() {
        let (exec, _) = executor(4);
        let calls = AtomicU32::new(0);
        let result: Result<Option<()>, Error> = exec
            .run_with(
                "strict",
                |_: &Error| false,
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(Error::from(ClusterError::Server("overloaded".into()))) }
                },
            )
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_jittered_backoff_scales_with_attempt() {
        let backoff = JitteredBackoff::new(1.5, 2.5);
        for attempt in 1..=3 {
            let delay = backoff.delay(attempt).as_secs_f64();
            assert!(delay >= 1.5 * attempt as f64 && delay <= 2.5 * attempt as f64);
        }
        assert_eq!(JitteredBackoff::new(0.0, 0.0).delay(2), Duration::ZERO);
    }

    #[test]
    fn test_new_rejects_zero_attempts() {
        assert!(RetryExecutor::new(&RetryConfig::without_backoff(0)).is_err());
        assert_eq!(
            RetryExecutor::new(&RetryConfig::default())
                .unwrap()
                .max_attempts(),
            3
        );
    }
}
