//! Pipeline steps.

use crate::dispatch::UnitOfWork;
use crate::models::{Result, WorkUnit};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One transform stage of a pipeline.
///
/// A step maps each unit of input rows to output rows. Outputs of all units
/// are concatenated in unit order to form the next step's input.
pub trait Step<T>: Send + Sync {
    /// Stable name, used to key checkpoints.
    fn name(&self) -> &str;

    fn process(&self, unit: &WorkUnit<T>) -> Result<Vec<T>>;
}

/// Step built from a closure.
pub struct FnStep<F> {
    name: String,
    f: F,
}

impl<F> FnStep<F> {
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<T, F> Step<T> for FnStep<F>
where
    F: Fn(&WorkUnit<T>) -> Result<Vec<T>> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&self, unit: &WorkUnit<T>) -> Result<Vec<T>> {
        (self.f)(unit)
    }
}

/// Runs a step as a unit of work and times it.
pub(crate) struct StepWork<T> {
    step: Arc<dyn Step<T>>,
}

impl<T> StepWork<T> {
    pub(crate) fn new(step: Arc<dyn Step<T>>) -> Self {
        Self { step }
    }
}

impl<T: Send + Sync + 'static> UnitOfWork<T> for StepWork<T> {
    type Output = (Vec<T>, Duration);

    fn process(&self, unit: &WorkUnit<T>) -> Result<Self::Output> {
        let started = Instant::now();
        let rows = self.step.process(unit)?;
        Ok((rows, started.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Rows;

    #[test]
    fn test_fn_step() {
        let double = FnStep::new("double", |unit: &WorkUnit<i64>| -> Result<Vec<i64>> {
            Ok(unit.rows.iter().map(|v| v * 2).collect())
        });
        let unit = WorkUnit::new(0, 0, Rows::owned(vec![1, 2, 3]));

        assert_eq!(Step::<i64>::name(&double), "double");
        assert_eq!(double.process(&unit).unwrap(), vec![2, 4, 6]);

        let work = StepWork::new(Arc::new(double) as Arc<dyn Step<i64>>);
        let (rows, _elapsed) = UnitOfWork::process(&work, &unit).unwrap();
        assert_eq!(rows, vec![2, 4, 6]);
    }
}
