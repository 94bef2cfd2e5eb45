//! Adaptive unit sizing.
//!
//! After each unit the sizer compares the measured duration with the target:
//! - slower than target × 1.2: shrink by ×0.8, never below the minimum
//! - faster than target × 0.8: grow by ×1.2, never above the maximum
//! - anywhere in between: keep the current size
//!
//! The dead band keeps measurement jitter from making the size oscillate.

use crate::models::{tracing_observer, ConfigError, SharedObserver, SizingConfig};
use std::ops::Range;
use std::time::Duration;

const UPPER_BAND: f64 = 1.2;
const LOWER_BAND: f64 = 0.8;

/// Mutable state of one sizer.
#[derive(Debug, Clone)]
pub struct SizingState {
    pub current: usize,
    pub min: usize,
    pub max: usize,
    pub target: Duration,
    /// Measured unit durations, oldest first
    pub durations: Vec<Duration>,
    /// Rows per executed unit, oldest first
    pub sizes: Vec<usize>,
}

impl SizingState {
    pub fn mean_duration(&self) -> Option<Duration> {
        if self.durations.is_empty() {
            return None;
        }
        let total: Duration = self.durations.iter().sum();
        Some(total / self.durations.len() as u32)
    }
}

/// Next size for a unit of `size` rows that took `elapsed`.
///
/// Integer scaling stalls for tiny sizes (5 × 1.2 rounds back to 5), so a
/// size that is not at its bound always moves by at least one row.
pub fn adjust_size(size: usize, min: usize, max: usize, target: Duration, elapsed: Duration) -> usize {
    if elapsed > target.mul_f64(UPPER_BAND) {
        let shrunk = (size * 4 / 5).min(size.saturating_sub(1));
        shrunk.max(min)
    } else if elapsed < target.mul_f64(LOWER_BAND) {
        let grown = (size * 6 / 5).max(size + 1);
        grown.min(max)
    } else {
        size
    }
}

/// Sizer that converges unit duration toward a target.
///
/// Owned by a single driver and updated between units only.
pub struct AdaptiveBatchSizer {
    state: SizingState,
    observer: SharedObserver,
}

impl AdaptiveBatchSizer {
    /// Create a sizer, failing fast on inconsistent bounds.
    pub fn new(config: &SizingConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            state: SizingState {
                current: config.initial_batch_size,
                min: config.min_batch_size,
                max: config.max_batch_size,
                target: config.target_duration(),
                durations: Vec::new(),
                sizes: Vec::new(),
            },
            observer: tracing_observer(),
        })
    }

    pub fn with_observer(mut self, observer: SharedObserver) -> Self {
        self.observer = observer;
        self
    }

    pub fn current_size(&self) -> usize {
        self.state.current
    }

    pub fn state(&self) -> &SizingState {
        &self.state
    }

    /// Range of the next unit starting at `offset`, clipped to `len`.
    ///
    /// Returns `None` once the dataset is exhausted.
    pub fn next_range(&self, offset: usize, len: usize) -> Option<Range<usize>> {
        if offset >= len {
            return None;
        }
        Some(offset..(offset + self.state.current).min(len))
    }

    /// Record a finished unit and compute the next size.
    pub fn record(&mut self, rows: usize, elapsed: Duration) -> usize {
        let state = &mut self.state;
        state.durations.push(elapsed);
        state.sizes.push(rows);

        let previous = state.current;
        state.current = adjust_size(previous, state.min, state.max, state.target, elapsed);
        if state.current != previous {
            self.observer.on_batch_resized(previous, state.current);
        }
        state.current
    }

    pub fn mean_duration(&self) -> Option<Duration> {
        self.state.mean_duration()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizer(initial: usize, min: usize, max: usize) -> AdaptiveBatchSizer {
        AdaptiveBatchSizer::new(&SizingConfig {
            initial_batch_size: initial,
            min_batch_size: min,
            max_batch_size: max,
            target_duration_ms: 1000,
            ..Default::default()
        })
        .unwrap()
    }

    fn secs(s: f64) -> Duration {
        Duration::from_secs_f64(s)
    }

    #[test]
    fn test_documented_trajectory() {
        let mut sizer = sizer(1000, 100, 10_000);
        let sizes: Vec<usize> = [1.5, 1.5, 0.5]
            .into_iter()
            .map(|d| sizer.record(sizer.current_size(), secs(d)))
            .collect();
        assert_eq!(sizes, vec![800, 640, 768]);
        assert_eq!(sizer.state().sizes, vec![1000, 800, 640]);
        assert_eq!(sizer.mean_duration(), Some(Duration::from_nanos(1_166_666_666)));
    }

    #[test]
    fn test_fast_units_grow_strictly_to_max() {
        let mut sizer = sizer(3, 1, 50);
        let mut previous = sizer.current_size();
        while previous < 50 {
            let next = sizer.record(previous, secs(0.1));
            assert!(next > previous && next <= 50);
            previous = next;
        }
        assert_eq!(sizer.record(50, secs(0.1)), 50);
    }

    #[test]
    fn test_slow_units_shrink_strictly_to_min() {
        let mut sizer = sizer(10_000, 7, 10_000);
        let mut previous = sizer.current_size();
        while previous > 7 {
            let next = sizer.record(previous, secs(3.0));
            assert!(next < previous && next >= 7);
            previous = next;
        }
        assert_eq!(sizer.record(7, secs(3.0)), 7);
    }

    #[test]
    fn test_dead_band_keeps_size() {
        let mut sizer = sizer(500, 100, 1000);
        for d in [0.8, 0.9, 1.0, 1.1, 1.2] {
            assert_eq!(sizer.record(500, secs(d)), 500);
        }
    }

    #[test]
    fn test_next_range_clips_remainder() {
        let sizer = sizer(400, 100, 1000);
        assert_eq!(sizer.next_range(0, 1000), Some(0..400));
        assert_eq!(sizer.next_range(800, 1000), Some(800..1000));
        assert_eq!(sizer.next_range(1000, 1000), None);
    }

    #[test]
    fn test_invalid_bounds_fail_at_construction() {
        let result = AdaptiveBatchSizer::new(&SizingConfig {
            min_batch_size: 2000,
            max_batch_size: 1000,
            initial_batch_size: 1500,
            ..Default::default()
        });
        assert!(result.is_err());
    }
}
