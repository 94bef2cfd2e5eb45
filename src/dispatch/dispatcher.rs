//! Parallel dispatch over a bounded worker pool.
//!
//! Guarantees:
//! - Unit ranges partition the dataset exactly, in order
//! - Every submitted unit yields exactly one outcome
//! - One unit failing (error or panic) never aborts its siblings
//! - Results come back ordered by sequence index, whatever the completion order
//!
//! There is no cancellation and no per-unit timeout: once submitted, every
//! unit runs to completion or failure.

use super::{DispatchResult, UnitOfWork};
use crate::models::{
    tracing_observer, ConfigError, Dataset, DispatchConfig, EtlError, ExecutionMode, Result,
    SharedObserver, WorkUnit,
};
use std::collections::HashSet;
use std::ops::Range;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

/// Splits datasets into units and runs them over a bounded pool.
pub struct ParallelDispatcher {
    /// Pool size (max units running at once)
    workers: usize,
    /// Memory-aliasing contract for unit rows
    mode: ExecutionMode,
    observer: SharedObserver,
}

impl ParallelDispatcher {
    /// Create a dispatcher with `workers` slots.
    pub fn new(workers: usize, mode: ExecutionMode) -> std::result::Result<Self, ConfigError> {
        if workers == 0 {
            return Err(ConfigError::invalid("dispatch.workers", "must be at least 1"));
        }
        Ok(Self {
            workers,
            mode,
            observer: tracing_observer(),
        })
    }

    pub fn from_config(config: &DispatchConfig) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        Self::new(config.worker_count(), config.execution)
    }

    /// Replace the observer.
    pub fn with_observer(mut self, observer: SharedObserver) -> Self {
        self.observer = observer;
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Split into `units` contiguous pieces of `ceil(len / units)` rows.
    ///
    /// Defaults to one unit per worker. The last unit may be shorter, and
    /// fewer units than requested come back when the dataset is small.
    pub fn split<D: Dataset>(
        &self,
        dataset: &D,
        units: Option<usize>,
    ) -> Result<Vec<WorkUnit<D::Row>>> {
        let n = units.unwrap_or(self.workers);
        if n == 0 {
            return Err(EtlError::InvalidInput(
                "cannot split a dataset into zero units".to_string(),
            ));
        }
        let len = dataset.len();
        if len == 0 {
            return Ok(Vec::new());
        }
        self.split_by_size(dataset, len.div_ceil(n))
    }

    /// Split into units of exactly `size` rows (last one may be shorter).
    pub fn split_by_size<D: Dataset>(
        &self,
        dataset: &D,
        size: usize,
    ) -> Result<Vec<WorkUnit<D::Row>>> {
        if size == 0 {
            return Err(EtlError::InvalidInput(
                "unit size must be at least 1".to_string(),
            ));
        }
        let len = dataset.len();
        let mut units = Vec::with_capacity(len.div_ceil(size));

        for (index, start) in (0..len).step_by(size).enumerate() {
            let end = (start + size).min(len);
            units.push(WorkUnit::new(index, start, dataset.rows(start..end)?));
        }

        debug!(rows = len, units = units.len(), unit_size = size, "Dataset split");
        Ok(units)
    }

    /// Split `dataset` and run `work` over every unit.
    pub async fn run<D, U>(
        &self,
        dataset: &D,
        work: Arc<U>,
        units: Option<usize>,
    ) -> Result<Vec<DispatchResult<U::Output>>>
    where
        D: Dataset,
        D::Row: Clone,
        U: UnitOfWork<D::Row> + 'static,
    {
        let units = self.split(dataset, units)?;
        Ok(self.run_units(units, work).await)
    }

    /// Run `work` over pre-split units.
    ///
    /// Failure slots are reported to the observer; they are never retried
    /// here. Wrap `work` in a retry adapter for that.
    pub async fn run_units<T, U>(
        &self,
        units: Vec<WorkUnit<T>>,
        work: Arc<U>,
    ) -> Vec<DispatchResult<U::Output>>
    where
        T: Clone + Send + Sync + 'static,
        U: UnitOfWork<T> + 'static,
    {
        let total = units.len();
        info!(
            units = total,
            workers = self.workers,
            mode = ?self.mode,
            "Dispatching units"
        );

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut expected: Vec<(usize, Range<usize>)> = Vec::with_capacity(total);
        let mut tasks = JoinSet::new();

        for unit in units {
            let unit = match self.mode {
                ExecutionMode::Shared => unit,
                ExecutionMode::Isolated => WorkUnit {
                    rows: unit.rows.detach(),
                    ..unit
                },
            };
            expected.push((unit.index, unit.range()));

            let semaphore = Arc::clone(&semaphore);
            let work = Arc::clone(&work);
            tasks.spawn(async move {
                let index = unit.index;
                let range = unit.range();
                let outcome = match semaphore.acquire_owned().await {
                    Ok(permit) => {
                        let handle = tokio::task::spawn_blocking(move || {
                            let _permit = permit;
                            work.process(&unit)
                        });
                        match handle.await {
                            Ok(result) => result,
                            Err(e) => Err(EtlError::Internal(format!("worker panicked: {e}"))),
                        }
                    }
                    Err(_) => Err(EtlError::Internal("Semaphore closed".to_string())),
                };
                (index, range, outcome)
            });
        }

        let mut results = Vec::with_capacity(total);
        let mut seen = HashSet::with_capacity(total);
        let mut completed = 0;

        while let Some(joined) = tasks.join_next().await {
            completed += 1;
            match joined {
                Ok((index, range, outcome)) => {
                    if let Err(e) = &outcome {
                        self.observer.on_unit_failed(index, e);
                    }
                    seen.insert(index);
                    results.push(DispatchResult {
                        index,
                        range,
                        outcome,
                    });
                }
                Err(e) => {
                    error!(error = %e, "Dispatch task aborted");
                }
            }
            self.observer.on_progress(completed, total);
        }

        // A task that died outside the worker still owes its slot.
        for (index, range) in expected {
            if !seen.contains(&index) {
                let e = EtlError::Internal(format!("unit {index} produced no outcome"));
                self.observer.on_unit_failed(index, &e);
                results.push(DispatchResult {
                    index,
                    range,
                    outcome: Err(e),
                });
            }
        }

        results.sort_by_key(|r| r.index);
        debug!(
            units = total,
            failed = super::failed_count(&results),
            "Dispatch finished"
        );
        results
    }
}
