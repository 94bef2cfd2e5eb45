//! Retry module - backoff executor and the unit-of-work wrapper.

mod executor;
mod retrying;

pub use executor::*;
pub use retrying::*;
