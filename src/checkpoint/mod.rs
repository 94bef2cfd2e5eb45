//! Checkpoint module for resumable pipeline execution.
//!
//! Provides:
//! - `CheckpointStore`: durable (pipeline, step) → state records with an
//!   atomic two-file write
//! - `StateSerializer`: pluggable state encoding, `JsonSerializer` by default

mod serializer;
mod store;

pub use serializer::*;
pub use store::*;
