//! Memory-bounded unit sizing.
//!
//! One static size per run: sample a prefix, derive bytes per row, and fit as
//! many rows as 80% of the ceiling allows.

use crate::models::{ConfigError, Dataset, SizingConfig};
use tracing::info;

const HEADROOM: f64 = 0.8;

/// Computes a unit size that keeps each unit under a memory ceiling.
#[derive(Debug, Clone)]
pub struct MemoryBoundedSizer {
    ceiling_bytes: u64,
    min_size: usize,
    sample_rows: usize,
}

impl MemoryBoundedSizer {
    pub fn new(
        ceiling_bytes: u64,
        min_size: usize,
        sample_rows: usize,
    ) -> Result<Self, ConfigError> {
        if ceiling_bytes == 0 {
            return Err(ConfigError::invalid(
                "sizing.memory_ceiling_mb",
                "must be greater than zero",
            ));
        }
        if min_size == 0 {
            return Err(ConfigError::invalid("sizing.min_batch_size", "must be at least 1"));
        }
        if sample_rows == 0 {
            return Err(ConfigError::invalid("sizing.sample_rows", "must be at least 1"));
        }
        Ok(Self {
            ceiling_bytes,
            min_size,
            sample_rows,
        })
    }

    pub fn from_config(config: &SizingConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Self::new(
            config.memory_ceiling_bytes(),
            config.min_batch_size,
            config.sample_rows,
        )
    }

    /// Average bytes per row over the sampled prefix.
    pub fn bytes_per_row<D: Dataset>(&self, dataset: &D) -> Option<f64> {
        let sample = self.sample_rows.min(dataset.len());
        if sample == 0 {
            return None;
        }
        Some(dataset.footprint(0..sample) as f64 / sample as f64)
    }

    /// Unit size for `dataset`, in `[min_size, len]`.
    ///
    /// The minimum wins when the dataset is shorter than it; an empty dataset
    /// yields the minimum.
    pub fn estimate<D: Dataset>(&self, dataset: &D) -> usize {
        let len = dataset.len();
        let Some(bytes_per_row) = self.bytes_per_row(dataset) else {
            return self.min_size;
        };

        let fitted = if bytes_per_row > 0.0 {
            (self.ceiling_bytes as f64 * HEADROOM / bytes_per_row).floor() as usize
        } else {
            len
        };
        let size = fitted.min(len).max(self.min_size);

        info!(
            rows = len,
            bytes_per_row = bytes_per_row as u64,
            ceiling_bytes = self.ceiling_bytes,
            batch_size = size,
            "Memory-bounded batch size"
        );
        size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RowFootprint, VecDataset};

    #[test]
    fn test_size_fits_ceiling() {
        // u64 rows are 8 bytes: 8000 * 0.8 / 8 = 800 rows.
        let sizer = MemoryBoundedSizer::new(8000, 10, 1000).unwrap();
        let data = VecDataset::new((0..10_000u64).collect());
        assert_eq!(sizer.bytes_per_row(&data), Some(8.0));
        assert_eq!(sizer.estimate(&data), 800);
    }

    #[test]
    fn test_clamped_to_dataset_length() {
        let sizer = MemoryBoundedSizer::new(1 << 30, 10, 1000).unwrap();
        let data = VecDataset::new((0..500u64).collect());
        assert_eq!(sizer.estimate(&data), 500);
    }

    #[test]
    fn test_minimum_wins() {
        let sizer = MemoryBoundedSizer::new(16, 100, 1000).unwrap();
        let data = VecDataset::new((0..10_000u64).collect());
        assert_eq!(sizer.estimate(&data), 100);

        let tiny = VecDataset::new(vec![1u64, 2, 3]);
        assert_eq!(sizer.estimate(&tiny), 100);
    }

    #[test]
    fn test_empty_dataset_yields_minimum() {
        let sizer = MemoryBoundedSizer::new(1024, 25, 1000).unwrap();
        let empty: VecDataset<u64> = VecDataset::new(Vec::new());
        assert_eq!(sizer.estimate(&empty), 25);
    }

    #[test]
    fn test_zero_footprint_yields_dataset_length() {
        struct Marker;
        impl RowFootprint for Marker {
            fn footprint(&self) -> usize {
                0
            }
        }

        let sizer = MemoryBoundedSizer::new(1024, 5, 1000).unwrap();
        let data = VecDataset::new((0..37).map(|_| Marker).collect());
        assert_eq!(sizer.bytes_per_row(&data), Some(0.0));
        assert_eq!(sizer.estimate(&data), 37);
    }

    #[test]
    fn test_sample_is_bounded_prefix() {
        let sizer = MemoryBoundedSizer::new(1 << 20, 1, 2).unwrap();
        let data = VecDataset::new(vec![
            "a".to_string(),
            "b".to_string(),
            "x".repeat(10_000),
        ]);
        let per_row = sizer.bytes_per_row(&data).unwrap();
        assert!(per_row < 100.0);
    }

    #[test]
    fn test_invalid_parameters_rejected() {
        assert!(MemoryBoundedSizer::new(0, 1, 1).is_err());
        assert!(MemoryBoundedSizer::new(1, 0, 1).is_err());
        assert!(MemoryBoundedSizer::new(1, 1, 0).is_err());
    }
}
