//! Sizing module - adaptive and memory-bounded unit sizers.

mod adaptive;
mod memory;

pub use adaptive::*;
pub use memory::*;
