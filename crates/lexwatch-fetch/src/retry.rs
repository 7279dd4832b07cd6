//! Exponential backoff with jitter, per-attempt timeouts, and a run-level
//! deadline.
//!
//! `delay_n = min(base * 2^n + jitter_n, cap)` with
//! `jitter_n` drawn from `[0, min(max_jitter, base * 2^n)]`. Bounding the
//! jitter by the exponential term keeps successive delays non-decreasing.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lexwatch_core::{OperationOutcome, RawSnapshot, RetryConfig, Source, SourceOperationLog};
use lexwatch_store::OperationLogStore;
use rand::Rng;
use tokio::time::Instant;
use tracing::warn;

use crate::{FetchError, Fetcher};

/// Errors the executor knows how to retry.
pub trait Retryable: Sized {
    fn is_transient(&self) -> bool;
    /// The error reported when an attempt exceeds its timeout.
    fn timed_out() -> Self;
    /// The error reported when the run deadline cuts work short.
    fn deadline_exceeded() -> Self;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_jitter: Duration,
    pub attempt_timeout: Duration,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(c: &RetryConfig) -> Self {
        Self {
            max_attempts: c.max_attempts.max(1),
            base_delay: Duration::from_millis(c.base_delay_ms),
            max_delay: Duration::from_millis(c.max_delay_ms),
            max_jitter: Duration::from_millis(c.max_jitter_ms),
            attempt_timeout: Duration::from_millis(c.attempt_timeout_ms),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::fetch_default())
    }
}

impl RetryPolicy {
    /// Delay before retry `n` (0-based) for a jitter fraction in `[0, 1]`.
    pub fn backoff(&self, n: u32, jitter_fraction: f64) -> Duration {
        let exp = self.base_delay.saturating_mul(2u32.saturating_pow(n));
        let jitter_bound = self.max_jitter.min(exp);
        let jitter = jitter_bound
            .mul_f64(jitter_fraction.clamp(0.0, 1.0))
            .min(jitter_bound);
        exp.saturating_add(jitter).min(self.max_delay)
    }

    /// Delay before retry `n` with a random jitter.
    pub fn delay_for(&self, n: u32) -> Duration {
        let fraction = rand::thread_rng().gen_range(0.0..=1.0);
        self.backoff(n, fraction)
    }
}

/// One attempt as seen by the executor.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptRecord {
    /// 1-based.
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: OperationOutcome,
    pub error: Option<String>,
}

#[derive(Debug)]
pub struct RetryReport<T, E> {
    pub result: Result<T, E>,
    pub attempts: Vec<AttemptRecord>,
}

#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` until it succeeds, fails terminally, runs out of attempts, or
    /// hits `deadline`. `op` receives the 1-based attempt number.
    pub async fn execute<T, E, F, Fut>(
        &self,
        deadline: Option<Instant>,
        mut op: F,
    ) -> RetryReport<T, E>
    where
        E: Retryable + Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max = self.policy.max_attempts.max(1);
        let mut attempts = Vec::new();

        for attempt in 1..=max {
            let now = Instant::now();
            let budget = match deadline {
                Some(d) if now >= d => {
                    let at = Utc::now();
                    let err = E::deadline_exceeded();
                    attempts.push(AttemptRecord {
                        attempt,
                        started_at: at,
                        finished_at: at,
                        outcome: OperationOutcome::Failure,
                        error: Some(err.to_string()),
                    });
                    return RetryReport {
                        result: Err(err),
                        attempts,
                    };
                }
                Some(d) => self.policy.attempt_timeout.min(d - now),
                None => self.policy.attempt_timeout,
            };

            let started_at = Utc::now();
            let result = match tokio::time::timeout(budget, op(attempt)).await {
                Ok(r) => r,
                Err(_) if deadline.is_some_and(|d| Instant::now() >= d) => {
                    Err(E::deadline_exceeded())
                }
                Err(_) => Err(E::timed_out()),
            };
            let finished_at = Utc::now();

            let err = match result {
                Ok(value) => {
                    attempts.push(AttemptRecord {
                        attempt,
                        started_at,
                        finished_at,
                        outcome: OperationOutcome::Success,
                        error: None,
                    });
                    return RetryReport {
                        result: Ok(value),
                        attempts,
                    };
                }
                Err(e) => e,
            };

            let transient = err.is_transient();
            let outcome = if transient && attempt == max {
                OperationOutcome::RetryExhausted
            } else {
                OperationOutcome::Failure
            };
            attempts.push(AttemptRecord {
                attempt,
                started_at,
                finished_at,
                outcome,
                error: Some(err.to_string()),
            });

            if !transient || attempt == max {
                return RetryReport {
                    result: Err(err),
                    attempts,
                };
            }

            let delay = self.policy.delay_for(attempt - 1);
            if deadline.is_some_and(|d| Instant::now() + delay >= d) {
                return RetryReport {
                    result: Err(E::deadline_exceeded()),
                    attempts,
                };
            }
            warn!(attempt, max_attempts = max, "transient failure, retrying in {delay:?}: {err}");
            tokio::time::sleep(delay).await;
        }

        // The loop always returns: `max >= 1` and the last iteration exits.
        RetryReport {
            result: Err(E::deadline_exceeded()),
            attempts,
        }
    }

    /// Fetch `source` with retries, appending one operation-log row per
    /// attempt.
    pub async fn fetch_source(
        &self,
        fetcher: &dyn Fetcher,
        source: &Source,
        deadline: Option<Instant>,
        log: &dyn OperationLogStore,
    ) -> Result<Vec<RawSnapshot>, FetchError> {
        let report = self.execute(deadline, |_| fetcher.fetch(source)).await;

        for attempt in &report.attempts {
            let entry = SourceOperationLog {
                source_id: source.id().to_string(),
                started_at: attempt.started_at,
                finished_at: attempt.finished_at,
                outcome: attempt.outcome,
                attempt_count: attempt.attempt,
                error_detail: attempt.error.clone(),
            };
            if let Err(e) = log.append_log(entry) {
                warn!(source_id = source.id(), "failed to write operation log: {e}");
            }
        }

        report.result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use lexwatch_core::{PollFrequency, SourceKind};
    use lexwatch_store::MemoryStore;
    use proptest::prelude::*;

    use super::*;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            max_jitter: Duration::from_secs(1),
            attempt_timeout: Duration::from_secs(30),
        }
    }

    /// Fails with `errors[n]` on attempt `n + 1`, then succeeds.
    struct Scripted {
        errors: Vec<FetchError>,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(errors: Vec<FetchError>) -> Self {
            Self {
                errors,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Fetcher for Scripted {
        fn kind(&self) -> SourceKind {
            SourceKind::Generic
        }

        async fn fetch(&self, source: &Source) -> Result<Vec<RawSnapshot>, FetchError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            if let Some(err) = self.errors.get(n) {
                return Err(err.clone());
            }
            Ok(vec![RawSnapshot::new(
                source.id(),
                source.id(),
                source.url(),
                "t",
                "v",
                "Article 1\nText",
                Utc::now(),
            )])
        }
    }

    fn source() -> Source {
        Source::new("page", "http://example.test", SourceKind::Generic, PollFrequency::OnTrigger)
    }

    fn unavailable() -> FetchError {
        FetchError::Server {
            status: 503,
            body: String::new(),
        }
    }

    // ── Backoff ──

    #[test]
    fn backoff_doubles_and_caps() {
        let p = policy(5);
        assert_eq!(p.backoff(0, 0.0), Duration::from_secs(5));
        assert_eq!(p.backoff(1, 0.0), Duration::from_secs(10));
        assert_eq!(p.backoff(2, 1.0), Duration::from_secs(21));
        assert_eq!(p.backoff(10, 1.0), Duration::from_secs(300));
        assert_eq!(p.backoff(u32::MAX, 0.5), Duration::from_secs(300));
    }

    #[test]
    fn jitter_never_exceeds_exponential_term() {
        let p = RetryPolicy {
            base_delay: Duration::from_millis(10),
            max_jitter: Duration::from_secs(1),
            ..policy(3)
        };
        assert_eq!(p.backoff(0, 1.0), Duration::from_millis(20));
    }

    proptest! {
        #[test]
        fn delays_non_decreasing(
            base_ms in 1u64..10_000,
            jitter_ms in 0u64..5_000,
            cap_factor in 1u64..200,
            fractions in prop::collection::vec(0.0f64..=1.0, 12),
        ) {
            let p = RetryPolicy {
                max_attempts: 12,
                base_delay: Duration::from_millis(base_ms),
                max_delay: Duration::from_millis(base_ms * cap_factor),
                max_jitter: Duration::from_millis(jitter_ms),
                attempt_timeout: Duration::from_secs(1),
            };
            let delays: Vec<Duration> = fractions
                .iter()
                .enumerate()
                .map(|(n, f)| p.backoff(n as u32, *f))
                .collect();
            for pair in delays.windows(2) {
                prop_assert!(pair[0] <= pair[1], "{:?}", delays);
            }
            for d in &delays {
                prop_assert!(*d <= p.max_delay);
            }
        }
    }

    // ── Executor ──

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_fourth_attempt() {
        let store = MemoryStore::new();
        let fetcher = Scripted::new(vec![unavailable(), FetchError::Timeout, unavailable()]);
        let executor = RetryExecutor::new(policy(5));

        let snaps = executor
            .fetch_source(&fetcher, &source(), None, &store)
            .await
            .unwrap();
        assert_eq!(snaps.len(), 1);

        let logs = store.logs("page").unwrap();
        assert_eq!(logs.len(), 4);
        let last = logs.last().unwrap();
        assert_eq!(last.outcome, OperationOutcome::Success);
        assert_eq!(last.attempt_count, 4);
        assert!(
            logs[..3]
                .iter()
                .all(|l| l.outcome == OperationOutcome::Failure && l.error_detail.is_some())
        );
        assert_eq!(
            logs.iter().map(|l| l.attempt_count).collect::<Vec<_>>(),
            [1, 2, 3, 4]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_after_max_attempts() {
        let store = MemoryStore::new();
        let fetcher = Scripted::new(vec![unavailable(); 10]);
        let executor = RetryExecutor::new(policy(5));

        let err = executor
            .fetch_source(&fetcher, &source(), None, &store)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Server { status: 503, .. }));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 5);

        let logs = store.logs("page").unwrap();
        assert_eq!(logs.len(), 5);
        assert_eq!(logs[4].outcome, OperationOutcome::RetryExhausted);
        assert!(logs[..4].iter().all(|l| l.outcome == OperationOutcome::Failure));
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_error_short_circuits() {
        let store = MemoryStore::new();
        let fetcher = Scripted::new(vec![FetchError::Server {
            status: 404,
            body: "gone".into(),
        }]);
        let executor = RetryExecutor::new(policy(5));

        let err = executor
            .fetch_source(&fetcher, &source(), None, &store)
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        let logs = store.logs("page").unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].outcome, OperationOutcome::Failure);
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_timeout_is_transient() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = RetryExecutor::new(RetryPolicy {
            attempt_timeout: Duration::from_secs(1),
            ..policy(2)
        });
        let report = executor
            .execute(None, |_| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok::<_, FetchError>(())
                }
            })
            .await;
        assert!(matches!(report.result, Err(FetchError::Timeout)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(report.attempts[1].outcome, OperationOutcome::RetryExhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_stops_backoff() {
        let executor = RetryExecutor::new(policy(5));
        let deadline = Instant::now() + Duration::from_secs(12);
        let started = Instant::now();

        let report = executor
            .execute(Some(deadline), |_| async { Err::<(), _>(FetchError::Timeout) })
            .await;

        assert!(matches!(report.result, Err(FetchError::DeadlineExceeded)));
        // 5 s then at least 10 s: the second backoff would overshoot.
        assert_eq!(report.attempts.len(), 2);
        assert!(Instant::now() <= deadline);
        assert!(Instant::now() - started >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_bounds_attempt() {
        let executor = RetryExecutor::new(policy(3));
        let deadline = Instant::now() + Duration::from_secs(2);

        let report = executor
            .execute(Some(deadline), |_| async {
                tokio::time::sleep(Duration::from_secs(20)).await;
                Ok::<_, FetchError>(())
            })
            .await;

        assert!(matches!(report.result, Err(FetchError::DeadlineExceeded)));
        assert_eq!(report.attempts.len(), 1);
        assert_eq!(report.attempts[0].outcome, OperationOutcome::Failure);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_deadline_records_failure_without_calling() {
        let executor = RetryExecutor::new(policy(3));
        let calls = AtomicU32::new(0);
        let deadline = Instant::now();
        tokio::time::advance(Duration::from_millis(1)).await;

        let report = executor
            .execute(Some(deadline), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, FetchError>(()) }
            })
            .await;
        assert!(matches!(report.result, Err(FetchError::DeadlineExceeded)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(report.attempts.len(), 1);
    }
}
