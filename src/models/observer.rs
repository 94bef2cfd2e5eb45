//! Observability port.
//!
//! Components receive an `Observer` at construction instead of reaching for a
//! global logger. The default implementation forwards everything to
//! `tracing`; tests and embedding applications plug in their own.

use super::EtlError;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Events emitted by the execution core.
///
/// Every method has a no-op default so implementors only override what they
/// care about.
pub trait Observer: Send + Sync {
    /// A unit finished (successfully or not).
    fn on_progress(&self, _completed: usize, _total: usize) {}

    /// A unit failed and its slot became a failure marker.
    fn on_unit_failed(&self, _index: usize, _error: &EtlError) {}

    /// The adaptive sizer moved to a new unit size.
    fn on_batch_resized(&self, _from: usize, _to: usize) {}

    /// A checkpoint became durable.
    fn on_checkpoint(&self, _pipeline: &str, _step: &str, _id: &str) {}
}

/// Observer that writes structured `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn on_progress(&self, completed: usize, total: usize) {
        debug!(completed, total, "Unit finished");
    }

    fn on_unit_failed(&self, index: usize, error: &EtlError) {
        warn!(unit = index, error = %error, "Unit failed");
    }

    fn on_batch_resized(&self, from: usize, to: usize) {
        if to < from {
            info!(from, to, "Reducing batch size");
        } else {
            info!(from, to, "Increasing batch size");
        }
    }

    fn on_checkpoint(&self, pipeline: &str, step: &str, id: &str) {
        info!(pipeline, step, checkpoint_id = id, "Checkpoint written");
    }
}

/// Adapts a `(completed, total)` closure into an observer.
///
/// Non-progress events still go to `tracing`.
pub struct ProgressFn<F> {
    callback: F,
}

impl<F> ProgressFn<F>
where
    F: Fn(usize, usize) + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F> Observer for ProgressFn<F>
where
    F: Fn(usize, usize) + Send + Sync,
{
    fn on_progress(&self, completed: usize, total: usize) {
        (self.callback)(completed, total);
    }

    fn on_unit_failed(&self, index: usize, error: &EtlError) {
        TracingObserver.on_unit_failed(index, error);
    }

    fn on_batch_resized(&self, from: usize, to: usize) {
        TracingObserver.on_batch_resized(from, to);
    }

    fn on_checkpoint(&self, pipeline: &str, step: &str, id: &str) {
        TracingObserver.on_checkpoint(pipeline, step, id);
    }
}

/// Shared handle used by every component.
pub type SharedObserver = Arc<dyn Observer>;

/// The default observer handle.
pub fn tracing_observer() -> SharedObserver {
    Arc::new(TracingObserver)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_progress_fn_forwards() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let observer = ProgressFn::new(move |done, total| {
            sink.lock().unwrap().push((done, total));
        });

        observer.on_progress(1, 3);
        observer.on_progress(2, 3);
        observer.on_unit_failed(0, &EtlError::processing("ignored by closure"));

        assert_eq!(*seen.lock().unwrap(), vec![(1, 3), (2, 3)]);
    }
}
