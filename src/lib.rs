//! batchwise - resilient execution core for batch ETL pipelines.
//!
//! ## Architecture
//!
//! A pipeline is a sequence of steps run over an in-memory dataset:
//! - **Sizing**: adaptive (converges on a target unit duration) or
//!   memory-bounded (one static size from a sampled row footprint)
//! - **Dispatch**: units run over a bounded worker pool; one unit failing
//!   never aborts its siblings, results come back in original order
//! - **Retry**: exponential backoff on transient failures, composed around
//!   any unit of work
//! - **Checkpoints**: state persisted after every step with an atomic
//!   two-file write, so a failed run resumes after its last completed step
//!
//! ## Example
//!
//! ```no_run
//! use batchwise::{Config, ExecutionEngine, FnStep, Result, WorkUnit};
//!
//! # async fn demo() -> Result<()> {
//! let mut engine = ExecutionEngine::new(Config::default())?
//!     .with_step(FnStep::new("double", |unit: &WorkUnit<i64>| -> Result<Vec<i64>> {
//!         Ok(unit.rows.iter().map(|v| v * 2).collect())
//!     }));
//!
//! let report = engine.run((0..10_000).collect()).await?;
//! assert!(report.is_success());
//! # Ok(())
//! # }
//! ```

pub mod checkpoint;
pub mod dispatch;
pub mod engine;
pub mod models;
pub mod retry;
pub mod sizing;

// Re-exports for convenience
pub use checkpoint::{Checkpoint, CheckpointMetadata, CheckpointStore, JsonSerializer, StateSerializer};
pub use dispatch::{DispatchResult, ParallelDispatcher, UnitOfWork};
pub use engine::{ExecutionEngine, FnStep, Step};
pub use models::{
    Config, Dataset, EtlError, ExecutionMode, Observer, Result, RunReport, VecDataset, WorkUnit,
};
pub use retry::{RetryExecutor, RetryPolicy, Retrying};
pub use sizing::{AdaptiveBatchSizer, MemoryBoundedSizer};
