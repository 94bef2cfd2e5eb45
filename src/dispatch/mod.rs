//! Dispatch module - unit-of-work capability and the parallel dispatcher.

mod dispatcher;
mod unit;

pub use dispatcher::*;
pub use unit::*;
