//! Retry as a composable wrapper around a unit of work.

use super::RetryExecutor;
use crate::dispatch::UnitOfWork;
use crate::models::{Result, WorkUnit};
use std::sync::Arc;

/// A unit of work whose failures go through a retry executor.
///
/// Backoff sleeps on the worker thread that runs the unit, so the unit keeps
/// its pool slot while it waits.
pub struct Retrying<U> {
    inner: U,
    executor: Arc<RetryExecutor>,
}

impl<U> Retrying<U> {
    pub fn new(inner: U, executor: Arc<RetryExecutor>) -> Self {
        Self { inner, executor }
    }
}

impl<T, U> UnitOfWork<T> for Retrying<U>
where
    U: UnitOfWork<T>,
{
    type Output = U::Output;

    fn process(&self, unit: &WorkUnit<T>) -> Result<U::Output> {
        let operation = format!("unit {}", unit.index);
        self.executor
            .call(&operation, || self.inner.process(unit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::ParallelDispatcher;
    use crate::models::{EtlError, ExecutionMode, RetryConfig, VecDataset};
    use crate::retry::RetryPolicy;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_retry_composes_with_dispatch() {
        let executor = Arc::new(RetryExecutor::new(
            RetryPolicy::new(&RetryConfig {
                max_attempts: 3,
                initial_delay_ms: 1,
                max_delay_ms: 2,
                ..Default::default()
            })
            .unwrap(),
        ));

        // Every unit fails exactly once, then succeeds.
        let failed_once = Mutex::new(HashSet::new());
        let flaky = move |unit: &WorkUnit<u32>| -> Result<usize> {
            if failed_once.lock().unwrap().insert(unit.index) {
                return Err(EtlError::transient(format!("unit {} hiccup", unit.index)));
            }
            Ok(unit.len())
        };

        let dispatcher = ParallelDispatcher::new(2, ExecutionMode::Shared).unwrap();
        let data = VecDataset::new((0..40u32).collect());
        let work = Arc::new(Retrying::new(flaky, Arc::clone(&executor)));

        let results = dispatcher.run(&data, work, Some(4)).await.unwrap();

        assert!(results.iter().all(|r| r.value() == Some(&10)));
        let stats = executor.stats();
        assert_eq!(stats.total_operations, 4);
        assert_eq!(stats.succeeded_after_retry, 4);
    }
}
