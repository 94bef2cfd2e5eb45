//! Retry with exponential backoff.
//!
//! Failure handling:
//! - Retryable failure before the last attempt: wait, grow the delay, try again
//! - Retryable failure on the last attempt: the original error is returned as is
//! - Non-retryable failure: returned immediately, no delay consumed
//!
//! Successful retries are invisible to the caller apart from the counters.

use crate::models::{Categorized, ConfigError, ErrorCategory, RetryConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Validated retry policy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    backoff_factor: f64,
    max_delay: Duration,
    retryable: HashSet<ErrorCategory>,
}

impl RetryPolicy {
    /// Build a policy, rejecting impossible bounds.
    pub fn new(config: &RetryConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            max_attempts: config.max_attempts,
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            backoff_factor: config.backoff_factor,
            max_delay: Duration::from_millis(config.max_delay_ms),
            retryable: config.retryable.iter().copied().collect(),
        })
    }

    /// Policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            backoff_factor: 1.0,
            max_delay: Duration::ZERO,
            retryable: HashSet::new(),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn is_retryable(&self, category: ErrorCategory) -> bool {
        self.retryable.contains(&category)
    }

    /// Delay that follows `current`, capped at the maximum.
    pub fn next_delay(&self, current: Duration) -> Duration {
        let scaled = Duration::try_from_secs_f64(current.as_secs_f64() * self.backoff_factor)
            .unwrap_or(self.max_delay);
        scaled.min(self.max_delay)
    }

    /// Delays slept between attempts if every attempt fails.
    pub fn delay_schedule(&self) -> Vec<Duration> {
        let mut delays = Vec::with_capacity(self.max_attempts.saturating_sub(1) as usize);
        let mut current = self.initial_delay.min(self.max_delay);
        for _ in 1..self.max_attempts {
            delays.push(current);
            current = self.next_delay(current);
        }
        delays
    }
}

/// Per-call retry bookkeeping.
#[derive(Debug)]
struct RetryState {
    attempt: u32,
    delay: Duration,
}

impl RetryState {
    fn new(policy: &RetryPolicy) -> Self {
        Self {
            attempt: 0,
            delay: policy.initial_delay.min(policy.max_delay),
        }
    }

    fn advance(&mut self, policy: &RetryPolicy) {
        self.delay = policy.next_delay(self.delay);
    }
}

enum Decision {
    Retry(Duration),
    GiveUp,
}

/// Outcome counters since creation or the last reset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryStats {
    pub total_operations: u64,
    pub succeeded_first_try: u64,
    pub succeeded_after_retry: u64,
    /// Retryable failures that ran out of attempts
    pub exhausted: u64,
    /// Failures outside the retryable categories
    pub failed_non_retryable: u64,
    pub total_attempts: u64,
    /// Successful operations over total operations (0.0 - 1.0)
    pub success_rate: f64,
    /// Operations that needed a retry to succeed over total operations (0.0 - 1.0)
    pub retry_rate: f64,
}

#[derive(Debug, Default)]
struct RetryCounters {
    total_operations: AtomicU64,
    succeeded_first_try: AtomicU64,
    succeeded_after_retry: AtomicU64,
    exhausted: AtomicU64,
    failed_non_retryable: AtomicU64,
    total_attempts: AtomicU64,
}

/// Runs callables under a retry policy and keeps outcome statistics.
///
/// Share it behind an `Arc`; counters are atomic.
#[derive(Debug)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    counters: RetryCounters,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            counters: RetryCounters::default(),
        }
    }

    /// Build from configuration, failing fast on invalid bounds.
    pub fn from_config(config: &RetryConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(RetryPolicy::new(config)?))
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op`, sleeping the current thread between attempts.
    ///
    /// Inside a worker pool the sleeping worker keeps its slot for the whole
    /// delay.
    pub fn call<T, E, F>(&self, operation: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Result<T, E>,
        E: Categorized + Display,
    {
        self.counters.total_operations.fetch_add(1, Ordering::Relaxed);
        let mut state = RetryState::new(&self.policy);

        loop {
            state.attempt += 1;
            self.counters.total_attempts.fetch_add(1, Ordering::Relaxed);

            match op() {
                Ok(value) => {
                    self.record_success(operation, state.attempt);
                    return Ok(value);
                }
                Err(e) => match self.decide(operation, &state, &e) {
                    Decision::Retry(delay) => {
                        std::thread::sleep(delay);
                        state.advance(&self.policy);
                    }
                    Decision::GiveUp => return Err(e),
                },
            }
        }
    }

    /// Run an async `op`, yielding to the runtime between attempts.
    pub async fn call_async<T, E, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Categorized + Display,
    {
        self.counters.total_operations.fetch_add(1, Ordering::Relaxed);
        let mut state = RetryState::new(&self.policy);

        loop {
            state.attempt += 1;
            self.counters.total_attempts.fetch_add(1, Ordering::Relaxed);

            match op().await {
                Ok(value) => {
                    self.record_success(operation, state.attempt);
                    return Ok(value);
                }
                Err(e) => match self.decide(operation, &state, &e) {
                    Decision::Retry(delay) => {
                        tokio::time::sleep(delay).await;
                        state.advance(&self.policy);
                    }
                    Decision::GiveUp => return Err(e),
                },
            }
        }
    }

    fn record_success(&self, operation: &str, attempt: u32) {
        if attempt == 1 {
            self.counters
                .succeeded_first_try
                .fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters
                .succeeded_after_retry
                .fetch_add(1, Ordering::Relaxed);
            info!(operation, attempt, "Succeeded after retry");
        }
    }

    fn decide<E>(&self, operation: &str, state: &RetryState, error: &E) -> Decision
    where
        E: Categorized + Display,
    {
        let category = error.category();

        if !self.policy.is_retryable(category) {
            self.counters
                .failed_non_retryable
                .fetch_add(1, Ordering::Relaxed);
            debug!(operation, ?category, error = %error, "Failure is not retryable");
            return Decision::GiveUp;
        }

        if state.attempt >= self.policy.max_attempts {
            self.counters.exhausted.fetch_add(1, Ordering::Relaxed);
            error!(
                operation,
                attempts = state.attempt,
                error = %error,
                "Giving up after final attempt"
            );
            return Decision::GiveUp;
        }

        warn!(
            operation,
            attempt = state.attempt,
            max_attempts = self.policy.max_attempts,
            delay_ms = state.delay.as_millis() as u64,
            error = %error,
            "Attempt failed, retrying"
        );
        Decision::Retry(state.delay)
    }

    /// Get statistics.
    pub fn stats(&self) -> RetryStats {
        let total_operations = self.counters.total_operations.load(Ordering::Relaxed);
        let succeeded_first_try = self.counters.succeeded_first_try.load(Ordering::Relaxed);
        let succeeded_after_retry = self.counters.succeeded_after_retry.load(Ordering::Relaxed);

        let (success_rate, retry_rate) = if total_operations > 0 {
            (
                (succeeded_first_try + succeeded_after_retry) as f64 / total_operations as f64,
                succeeded_after_retry as f64 / total_operations as f64,
            )
        } else {
            (0.0, 0.0)
        };

        RetryStats {
            total_operations,
            succeeded_first_try,
            succeeded_after_retry,
            exhausted: self.counters.exhausted.load(Ordering::Relaxed),
            failed_non_retryable: self.counters.failed_non_retryable.load(Ordering::Relaxed),
            total_attempts: self.counters.total_attempts.load(Ordering::Relaxed),
            success_rate,
            retry_rate,
        }
    }

    pub fn reset_stats(&self) {
        for counter in [
            &self.counters.total_operations,
            &self.counters.succeeded_first_try,
            &self.counters.succeeded_after_retry,
            &self.counters.exhausted,
            &self.counters.failed_non_retryable,
            &self.counters.total_attempts,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EtlError;
    use std::cell::Cell;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(&RetryConfig {
            max_attempts,
            initial_delay_ms: 1,
            backoff_factor: 2.0,
            max_delay_ms: 4,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_succeeds_after_transient_failures() {
        let executor = RetryExecutor::new(fast_policy(3));
        let calls = Cell::new(0);

        let result: Result<&str, EtlError> = executor.call("flaky", || {
            calls.set(calls.get() + 1);
            if calls.get() <= 2 {
                Err(EtlError::transient(format!("attempt {}", calls.get())))
            } else {
                Ok("done")
            }
        });

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.get(), 3);
        let stats = executor.stats();
        assert_eq!(stats.succeeded_after_retry, 1);
        assert_eq!(stats.succeeded_first_try, 0);
        assert_eq!(stats.total_attempts, 3);
    }

    #[test]
    fn test_exhaustion_returns_original_error() {
        let executor = RetryExecutor::new(fast_policy(2));
        let calls = Cell::new(0);

        let result: Result<(), EtlError> = executor.call("flaky", || {
            calls.set(calls.get() + 1);
            Err(EtlError::transient(format!("attempt {}", calls.get())))
        });

        match result {
            Err(EtlError::Transient(message)) => assert_eq!(message, "attempt 2"),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(calls.get(), 2);
        assert_eq!(executor.stats().exhausted, 1);
    }

    #[test]
    fn test_non_retryable_propagates_immediately() {
        let executor = RetryExecutor::new(fast_policy(5));
        let calls = Cell::new(0);

        let result: Result<(), EtlError> = executor.call("bad input", || {
            calls.set(calls.get() + 1);
            Err(EtlError::processing("row 7 has no key"))
        });

        assert!(matches!(result, Err(EtlError::Processing(_))));
        assert_eq!(calls.get(), 1);
        let stats = executor.stats();
        assert_eq!(stats.failed_non_retryable, 1);
        assert_eq!(stats.exhausted, 0);
    }

    #[test]
    fn test_delay_schedule_is_capped_and_non_decreasing() {
        let policy = RetryPolicy::new(&RetryConfig {
            max_attempts: 6,
            initial_delay_ms: 100,
            backoff_factor: 2.0,
            max_delay_ms: 300,
            ..Default::default()
        })
        .unwrap();

        let schedule = policy.delay_schedule();
        assert_eq!(
            schedule,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(300),
                Duration::from_millis(300),
                Duration::from_millis(300),
            ]
        );
        assert!(schedule.windows(2).all(|w| w[0] <= w[1]));
        assert!(RetryPolicy::no_retry().delay_schedule().is_empty());
    }

    #[test]
    fn test_stats_rates_and_reset() {
        let executor = RetryExecutor::new(fast_policy(2));
        let _: Result<u8, EtlError> = executor.call("ok", || Ok(1));
        let calls = Cell::new(0);
        let _: Result<u8, EtlError> = executor.call("retry once", || {
            calls.set(calls.get() + 1);
            if calls.get() == 1 {
                Err(EtlError::Timeout(Duration::from_millis(5)))
            } else {
                Ok(2)
            }
        });
        let _: Result<u8, EtlError> = executor.call("fatal", || Err(EtlError::Internal("bug".into())));
        let _: Result<u8, EtlError> = executor.call("exhaust", || Err(EtlError::transient("nope")));

        let stats = executor.stats();
        assert_eq!(stats.total_operations, 4);
        assert!((stats.success_rate - 0.5).abs() < 1e-9);
        assert!((stats.retry_rate - 0.25).abs() < 1e-9);

        executor.reset_stats();
        let stats = executor.stats();
        assert_eq!(stats.total_operations, 0);
        assert_eq!(stats.success_rate, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_waits_full_backoff() {
        let executor = RetryExecutor::new(
            RetryPolicy::new(&RetryConfig {
                max_attempts: 3,
                initial_delay_ms: 1000,
                backoff_factor: 3.0,
                max_delay_ms: 60_000,
                ..Default::default()
            })
            .unwrap(),
        );
        let start = tokio::time::Instant::now();
        let calls = Cell::new(0);

        let result: Result<u32, EtlError> = executor
            .call_async("remote", || {
                calls.set(calls.get() + 1);
                let attempt = calls.get();
                async move {
                    if attempt < 3 {
                        Err(EtlError::io(
                            "reading source",
                            std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"),
                        ))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(4) && waited < Duration::from_secs(5));
        assert_eq!(executor.stats().succeeded_after_retry, 1);
    }
}
