//! Unit-of-work capability and per-unit outcomes.

use crate::models::{EtlError, Result, WorkUnit};
use std::ops::Range;

/// Work applied to one unit.
///
/// Implementations must not assume anything about which thread runs them or
/// in which order sibling units complete. Closures of the shape
/// `Fn(&WorkUnit<T>) -> Result<O>` implement this directly.
pub trait UnitOfWork<T>: Send + Sync {
    type Output: Send + 'static;

    fn process(&self, unit: &WorkUnit<T>) -> Result<Self::Output>;
}

impl<T, O, F> UnitOfWork<T> for F
where
    F: Fn(&WorkUnit<T>) -> Result<O> + Send + Sync,
    O: Send + 'static,
{
    type Output = O;

    fn process(&self, unit: &WorkUnit<T>) -> Result<O> {
        self(unit)
    }
}

/// Outcome of one dispatched unit.
#[derive(Debug)]
pub struct DispatchResult<R> {
    /// Sequence index of the unit
    pub index: usize,
    /// Rows the unit covered in the source dataset
    pub range: Range<usize>,
    /// Value, or the failure that replaced it
    pub outcome: std::result::Result<R, EtlError>,
}

impl<R> DispatchResult<R> {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn value(&self) -> Option<&R> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&EtlError> {
        self.outcome.as_ref().err()
    }

    /// Drop the failure detail, keeping only the slot.
    pub fn into_value(self) -> Option<R> {
        self.outcome.ok()
    }
}

/// Count of failure markers in an ordered result list.
pub fn failed_count<R>(results: &[DispatchResult<R>]) -> usize {
    results.iter().filter(|r| !r.is_success()).count()
}
