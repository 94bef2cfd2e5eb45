//! Execution engine: drives a sequence of steps over a dataset.
//!
//! Flow per step:
//! rows → sizer picks unit boundaries → units run (each wrapped in retry) →
//! outputs concatenated in unit order → checkpoint → next step
//!
//! Only configuration and checkpoint-load failures surface as `Err`. Anything
//! that goes wrong while steps execute ends up in the `RunReport`.

use super::step::{Step, StepWork};
use crate::checkpoint::{Annotations, CheckpointStore, JsonSerializer, StateSerializer, StepRef};
use crate::dispatch::{ParallelDispatcher, UnitOfWork};
use crate::models::{
    tracing_observer, CheckpointError, Config, Dataset, DispatchMode, EtlError, ExecutionMode,
    ExecutionStats, FailurePolicy, MetricsSnapshot, Result, RowFootprint, RunReport, RunStatus,
    SharedObserver, SizingStrategy, VecDataset, WorkUnit,
};
use crate::retry::{RetryExecutor, Retrying};
use crate::sizing::{AdaptiveBatchSizer, MemoryBoundedSizer};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

type StepUnit<T> = Retrying<StepWork<T>>;

/// Counters accumulated over the engine's lifetime.
#[derive(Debug, Default)]
struct EngineMetrics {
    batch_sizes: Vec<usize>,
    durations: Vec<Duration>,
    units_total: usize,
    units_failed: usize,
    rows_processed: usize,
    checkpoints_written: usize,
}

/// Output of one executed step.
struct StepOutput<T> {
    rows: Vec<T>,
    units: usize,
    failed: usize,
}

/// Where a run starts.
struct StartPoint<T> {
    rows: Vec<T>,
    step: usize,
    resumed_from: Option<String>,
}

/// Composes sizing, dispatch, retry and checkpointing into pipeline runs.
pub struct ExecutionEngine<T, S = JsonSerializer> {
    config: Config,
    steps: Vec<Arc<dyn Step<T>>>,
    observer: SharedObserver,
    retry: Arc<RetryExecutor>,
    store: Option<CheckpointStore<S>>,
    metrics: EngineMetrics,
    stats: ExecutionStats,
    output: Option<Vec<T>>,
}

impl<T> ExecutionEngine<T, JsonSerializer>
where
    T: Clone + Serialize + DeserializeOwned + RowFootprint + Send + Sync + 'static,
{
    /// Build an engine, failing fast on invalid configuration.
    ///
    /// Opens a JSON checkpoint store at the configured root when
    /// checkpointing is enabled.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let store = if config.checkpoint.enabled {
            Some(CheckpointStore::new(config.checkpoint.resolved_root())?)
        } else {
            None
        };
        let retry = Arc::new(RetryExecutor::from_config(&config.retry)?);

        Ok(Self {
            config,
            steps: Vec::new(),
            observer: tracing_observer(),
            retry,
            store,
            metrics: EngineMetrics::default(),
            stats: ExecutionStats::default(),
            output: None,
        })
    }
}

impl<T, S> ExecutionEngine<T, S>
where
    T: Clone + Serialize + DeserializeOwned + RowFootprint + Send + Sync + 'static,
    S: StateSerializer,
{
    /// Append a step.
    pub fn add_step(&mut self, step: impl Step<T> + 'static) -> &mut Self {
        self.steps.push(Arc::new(step));
        self
    }

    pub fn with_step(mut self, step: impl Step<T> + 'static) -> Self {
        self.add_step(step);
        self
    }

    pub fn with_observer(mut self, observer: SharedObserver) -> Self {
        self.observer = observer;
        self
    }

    /// Swap the checkpoint store, possibly for one with another serializer.
    pub fn with_store<S2: StateSerializer>(self, store: CheckpointStore<S2>) -> ExecutionEngine<T, S2> {
        ExecutionEngine {
            config: self.config,
            steps: self.steps,
            observer: self.observer,
            retry: self.retry,
            store: Some(store),
            metrics: self.metrics,
            stats: self.stats,
            output: self.output,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> Option<&CheckpointStore<S>> {
        self.store.as_ref()
    }

    /// Whether a checkpoint exists to resume this pipeline from.
    pub fn can_resume(&self) -> Result<bool> {
        match &self.store {
            Some(store) => Ok(!store.list(Some(&self.config.pipeline.name))?.is_empty()),
            None => Ok(false),
        }
    }

    /// Run every step over `rows`.
    ///
    /// With `pipeline.resume` set, restarts after the step recorded in the
    /// latest checkpoint, from that checkpoint's state.
    pub async fn run(&mut self, rows: Vec<T>) -> Result<RunReport> {
        if self.steps.is_empty() {
            return Err(EtlError::InvalidInput("pipeline has no steps".to_string()));
        }

        let pipeline = self.config.pipeline.name.clone();
        let started_at = Utc::now();
        let clock = Instant::now();

        let start = self.start_point(rows)?;
        let rows_in = start.rows.len();
        let mut rows_processed = if start.step >= self.steps.len() { rows_in } else { 0 };
        let mut data = start.rows;
        let mut steps_completed = Vec::new();
        let mut checkpoints = Vec::new();
        let mut failed_units = 0;
        let mut failure = None;

        info!(
            pipeline = %pipeline,
            rows = rows_in,
            steps = self.steps.len(),
            first_step = start.step,
            "Starting pipeline"
        );

        let steps: Vec<Arc<dyn Step<T>>> = self.steps.iter().skip(start.step).cloned().collect();
        for (offset, step) in steps.into_iter().enumerate() {
            let step_index = start.step + offset;
            let name = step.name().to_string();
            let step_clock = Instant::now();

            let output = match self.execute_step(step, data).await {
                Ok(output) => output,
                Err(e) => {
                    failure = Some(e);
                    data = Vec::new();
                    break;
                }
            };
            failed_units += output.failed;

            if output.failed > 0 && self.config.pipeline.failure_policy == FailurePolicy::FailRun {
                failure = Some(EtlError::StepFailed {
                    step: name,
                    failed: output.failed,
                    total: output.units,
                });
                data = Vec::new();
                break;
            }

            data = output.rows;
            rows_processed = data.len();
            info!(
                step = %name,
                rows = data.len(),
                units = output.units,
                failed = output.failed,
                duration_ms = step_clock.elapsed().as_millis() as u64,
                "Step completed"
            );

            match self.checkpoint(&name, step_index, &data, output.failed) {
                Ok(Some(id)) => checkpoints.push(id),
                Ok(None) => {}
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
            steps_completed.push(name);
        }

        let status = if failure.is_none() {
            RunStatus::Success
        } else {
            RunStatus::Failed
        };
        let report = RunReport {
            pipeline: pipeline.clone(),
            status,
            started_at,
            finished_at: Utc::now(),
            duration_secs: clock.elapsed().as_secs_f64(),
            rows_in,
            rows_processed,
            steps_completed,
            resumed_from: start.resumed_from,
            checkpoints,
            failed_units,
            error: failure.as_ref().map(ToString::to_string),
        };

        match &failure {
            None => {
                self.metrics.rows_processed += report.rows_processed;
                self.output = Some(data);
                info!(
                    pipeline = %pipeline,
                    rows = report.rows_processed,
                    failed_units,
                    duration_secs = report.duration_secs,
                    "Pipeline completed"
                );
            }
            Some(e) => {
                self.output = None;
                error!(pipeline = %pipeline, error = %e, "Pipeline failed");
            }
        }

        self.stats.record(&report);
        Ok(report)
    }

    /// Output rows of the last successful run.
    pub fn take_output(&mut self) -> Option<Vec<T>> {
        self.output.take()
    }

    /// Metrics accumulated across every run of this engine.
    pub fn metrics(&self) -> MetricsSnapshot {
        let m = &self.metrics;
        let mean = if m.durations.is_empty() {
            None
        } else {
            let total: Duration = m.durations.iter().sum();
            Some(total.as_secs_f64() / m.durations.len() as f64)
        };
        MetricsSnapshot {
            batch_sizes: m.batch_sizes.clone(),
            mean_unit_duration_secs: mean,
            units_total: m.units_total,
            units_failed: m.units_failed,
            rows_processed: m.rows_processed,
            checkpoints_written: m.checkpoints_written,
            retry: self.retry.stats(),
        }
    }

    /// Totals across every run of this engine.
    pub fn execution_stats(&self) -> &ExecutionStats {
        &self.stats
    }

    fn start_point(&self, rows: Vec<T>) -> Result<StartPoint<T>> {
        let fresh = |rows: Vec<T>| StartPoint {
            rows,
            step: 0,
            resumed_from: None,
        };

        let store = match (&self.store, self.config.pipeline.resume) {
            (Some(store), true) => store,
            _ => return Ok(fresh(rows)),
        };

        let Some(checkpoint) = store.latest::<Vec<T>>(&self.config.pipeline.name)? else {
            info!(pipeline = %self.config.pipeline.name, "No checkpoint found, starting fresh");
            return Ok(fresh(rows));
        };

        let meta = &checkpoint.metadata;
        let matches = self
            .steps
            .get(meta.step_index)
            .is_some_and(|step| step.name() == meta.step);
        if !matches {
            return Err(CheckpointError::corrupt(
                &meta.id,
                format!(
                    "step '{}' at index {} is not part of this pipeline",
                    meta.step, meta.step_index
                ),
            )
            .into());
        }

        info!(
            pipeline = %meta.pipeline,
            checkpoint = %meta.id,
            step = %meta.step,
            rows = checkpoint.state.len(),
            "Resuming from checkpoint"
        );
        Ok(StartPoint {
            step: meta.step_index + 1,
            resumed_from: Some(meta.step.clone()),
            rows: checkpoint.state,
        })
    }

    async fn execute_step(&mut self, step: Arc<dyn Step<T>>, rows: Vec<T>) -> Result<StepOutput<T>> {
        let dataset = VecDataset::new(rows);
        let work = Arc::new(Retrying::new(StepWork::new(step), Arc::clone(&self.retry)));

        match self.config.dispatch.mode {
            DispatchMode::Sequential => self.run_sequential(&dataset, work).await,
            DispatchMode::Parallel => self.run_parallel(&dataset, work).await,
        }
    }

    /// One unit at a time on the blocking pool, resizing between units.
    async fn run_sequential(
        &mut self,
        dataset: &VecDataset<T>,
        work: Arc<StepUnit<T>>,
    ) -> Result<StepOutput<T>> {
        let len = dataset.len();
        let sizing = &self.config.sizing;
        let mut adaptive = match sizing.strategy {
            SizingStrategy::Adaptive => {
                Some(AdaptiveBatchSizer::new(sizing)?.with_observer(Arc::clone(&self.observer)))
            }
            _ => None,
        };
        let static_size = match sizing.strategy {
            SizingStrategy::MemoryBounded => MemoryBoundedSizer::from_config(sizing)?.estimate(dataset),
            _ => sizing.initial_batch_size,
        };
        let fail_fast = self.config.pipeline.failure_policy == FailurePolicy::FailRun;

        let mut output = StepOutput {
            rows: Vec::with_capacity(len),
            units: 0,
            failed: 0,
        };
        let mut offset = 0;

        while offset < len {
            let size = adaptive.as_ref().map_or(static_size, |s| s.current_size());
            let end = (offset + size).min(len);
            let index = output.units;
            let mut unit = WorkUnit::new(index, offset, dataset.rows(offset..end)?);
            if self.config.dispatch.execution == ExecutionMode::Isolated {
                unit.rows = unit.rows.detach();
            }

            let task_work = Arc::clone(&work);
            let outcome = tokio::task::spawn_blocking(move || task_work.process(&unit))
                .await
                .unwrap_or_else(|e| Err(EtlError::Internal(format!("worker panicked: {e}"))));

            output.units += 1;
            self.metrics.units_total += 1;
            self.metrics.batch_sizes.push(end - offset);

            // Durations come from the successful attempt only, never the
            // backoff sleeps around it. Failed units leave the size alone.
            match outcome {
                Ok((rows, elapsed)) => {
                    self.metrics.durations.push(elapsed);
                    if let Some(sizer) = adaptive.as_mut() {
                        sizer.record(end - offset, elapsed);
                    }
                    output.rows.extend(rows);
                }
                Err(e) => {
                    output.failed += 1;
                    self.metrics.units_failed += 1;
                    self.observer.on_unit_failed(index, &e);
                }
            }
            offset = end;

            let remaining = len - offset;
            let next = adaptive.as_ref().map_or(static_size, |s| s.current_size());
            self.observer
                .on_progress(output.units, output.units + remaining.div_ceil(next));

            if fail_fast && output.failed > 0 {
                break;
            }
        }

        Ok(output)
    }

    /// All units at once over the bounded pool.
    async fn run_parallel(
        &mut self,
        dataset: &VecDataset<T>,
        work: Arc<StepUnit<T>>,
    ) -> Result<StepOutput<T>> {
        let dispatcher = ParallelDispatcher::from_config(&self.config.dispatch)?
            .with_observer(Arc::clone(&self.observer));
        let sizing = &self.config.sizing;

        let units = match sizing.strategy {
            SizingStrategy::Adaptive => dispatcher.split(dataset, None)?,
            SizingStrategy::MemoryBounded => {
                let size = MemoryBoundedSizer::from_config(sizing)?.estimate(dataset);
                dispatcher.split_by_size(dataset, size)?
            }
            SizingStrategy::Fixed => dispatcher.split_by_size(dataset, sizing.initial_batch_size)?,
        };

        let results = dispatcher.run_units(units, work).await;
        let mut output = StepOutput {
            rows: Vec::with_capacity(dataset.len()),
            units: results.len(),
            failed: 0,
        };

        for result in results {
            self.metrics.units_total += 1;
            self.metrics.batch_sizes.push(result.range.len());
            match result.outcome {
                Ok((rows, elapsed)) => {
                    self.metrics.durations.push(elapsed);
                    output.rows.extend(rows);
                }
                Err(_) => {
                    output.failed += 1;
                    self.metrics.units_failed += 1;
                }
            }
        }

        Ok(output)
    }

    /// Persist `rows` as the state after `step`, then apply retention.
    fn checkpoint(
        &mut self,
        step: &str,
        step_index: usize,
        rows: &[T],
        failed_units: usize,
    ) -> Result<Option<String>> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        let pipeline = &self.config.pipeline.name;

        let mut annotations = Annotations::new();
        annotations.insert("rows".to_string(), json!(rows.len()));
        annotations.insert("failed_units".to_string(), json!(failed_units));
        annotations.insert("total_steps".to_string(), json!(self.steps.len()));

        let id = store.create(
            StepRef {
                pipeline,
                step,
                step_index,
            },
            rows,
            annotations,
        )?;
        self.metrics.checkpoints_written += 1;
        self.observer.on_checkpoint(pipeline, step, &id);

        if let Some(keep_last) = self.config.checkpoint.keep_last {
            if let Err(e) = store.prune(pipeline, keep_last) {
                warn!(pipeline = %pipeline, error = %e, "Checkpoint retention failed");
            }
        }
        Ok(Some(id))
    }
}
