//! Engine module - steps and the execution engine that drives them.

mod runner;
mod step;

pub use runner::*;
pub use step::{FnStep, Step};
