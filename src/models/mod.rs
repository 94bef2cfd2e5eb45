//! Core data models for batchwise.
//!
//! - `config`: every tunable, loaded from TOML and validated up front
//! - `error`: failure taxonomy shared by all components
//! - `dataset`: the dataset capability and work units
//! - `observer`: injected observability port
//! - `report`: run outcomes and metrics snapshots

mod config;
mod dataset;
mod error;
mod observer;
mod report;

pub use config::*;
pub use dataset::*;
pub use error::*;
pub use observer::*;
pub use report::*;
