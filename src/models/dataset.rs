//! Dataset abstraction and work units.
//!
//! The execution core never looks inside a row. It only needs to know how
//! many rows there are, how to view a contiguous range of them, and roughly
//! how much memory a range occupies.

use super::{EtlError, Result};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::{Deref, Range};
use std::sync::Arc;

/// Read-only view over a contiguous run of rows.
///
/// Cloning is cheap: the backing storage is reference counted and never
/// mutated once built.
pub struct Rows<T> {
    data: Arc<[T]>,
    range: Range<usize>,
}

impl<T> Rows<T> {
    /// View `range` of shared storage without copying.
    pub fn shared(data: Arc<[T]>, range: Range<usize>) -> Self {
        debug_assert!(range.start <= range.end && range.end <= data.len());
        Self { data, range }
    }

    /// Take ownership of rows that nobody else references.
    pub fn owned(rows: Vec<T>) -> Self {
        let len = rows.len();
        Self {
            data: rows.into(),
            range: 0..len,
        }
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data[self.range.clone()]
    }

    /// Whether this view aliases storage held by someone else.
    pub fn is_shared(&self) -> bool {
        Arc::strong_count(&self.data) > 1
    }
}

impl<T: Clone> Rows<T> {
    /// Copy the viewed rows into private storage.
    pub fn detach(&self) -> Self {
        Self::owned(self.as_slice().to_vec())
    }
}

impl<T> Clone for Rows<T> {
    fn clone(&self) -> Self {
        Self {
            data: Arc::clone(&self.data),
            range: self.range.clone(),
        }
    }
}

impl<T> Deref for Rows<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.as_slice()
    }
}

impl<T: fmt::Debug> fmt::Debug for Rows<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.as_slice()).finish()
    }
}

/// A contiguous, ordered slice of a dataset with its sequence index.
#[derive(Debug, Clone)]
pub struct WorkUnit<T> {
    /// Position of this unit in submission order
    pub index: usize,
    /// Offset of the first row in the source dataset
    pub offset: usize,
    /// The rows themselves
    pub rows: Rows<T>,
}

impl<T> WorkUnit<T> {
    pub fn new(index: usize, offset: usize, rows: Rows<T>) -> Self {
        Self {
            index,
            offset,
            rows,
        }
    }

    /// Row range covered in the source dataset.
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.rows.len()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Tabular data the core can size and slice.
pub trait Dataset: Send + Sync {
    type Row: Send + Sync + 'static;

    /// Number of rows.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// View a contiguous range. Lazy datasets may materialise here.
    fn rows(&self, range: Range<usize>) -> Result<Rows<Self::Row>>;

    /// Approximate bytes held by the rows in `range`.
    fn footprint(&self, range: Range<usize>) -> usize;
}

/// Approximate in-memory size of a value, including owned heap data.
pub trait RowFootprint {
    fn footprint(&self) -> usize;
}

macro_rules! fixed_footprint {
    ($($t:ty),* $(,)?) => {
        $(impl RowFootprint for $t {
            fn footprint(&self) -> usize {
                std::mem::size_of::<$t>()
            }
        })*
    };
}

fixed_footprint!(bool, char, u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64);

impl RowFootprint for String {
    fn footprint(&self) -> usize {
        std::mem::size_of::<String>() + self.capacity()
    }
}

impl<T: RowFootprint> RowFootprint for Option<T> {
    fn footprint(&self) -> usize {
        match self {
            Some(v) => v.footprint().max(std::mem::size_of::<Option<T>>()),
            None => std::mem::size_of::<Option<T>>(),
        }
    }
}

impl<T: RowFootprint> RowFootprint for Vec<T> {
    fn footprint(&self) -> usize {
        let spare = (self.capacity() - self.len()) * std::mem::size_of::<T>();
        std::mem::size_of::<Vec<T>>() + spare + self.iter().map(RowFootprint::footprint).sum::<usize>()
    }
}

impl<V: RowFootprint> RowFootprint for HashMap<String, V> {
    fn footprint(&self) -> usize {
        std::mem::size_of::<Self>()
            + self
                .iter()
                .map(|(k, v)| k.footprint() + v.footprint())
                .sum::<usize>()
    }
}

impl<V: RowFootprint> RowFootprint for BTreeMap<String, V> {
    fn footprint(&self) -> usize {
        std::mem::size_of::<Self>()
            + self
                .iter()
                .map(|(k, v)| k.footprint() + v.footprint())
                .sum::<usize>()
    }
}

impl RowFootprint for serde_json::Value {
    fn footprint(&self) -> usize {
        use serde_json::Value;

        let heap = match self {
            Value::String(s) => s.capacity(),
            Value::Array(items) => items.iter().map(RowFootprint::footprint).sum(),
            Value::Object(map) => map
                .iter()
                .map(|(k, v)| k.footprint() + v.footprint())
                .sum(),
            Value::Null | Value::Bool(_) | Value::Number(_) => 0,
        };
        std::mem::size_of::<Value>() + heap
    }
}

/// Materialised dataset backed by shared, immutable storage.
pub struct VecDataset<T> {
    data: Arc<[T]>,
}

impl<T> VecDataset<T> {
    pub fn new(rows: Vec<T>) -> Self {
        Self { data: rows.into() }
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    fn check_range(&self, range: &Range<usize>) -> Result<()> {
        if range.start > range.end || range.end > self.data.len() {
            return Err(EtlError::InvalidInput(format!(
                "row range {}..{} out of bounds for dataset of {} rows",
                range.start,
                range.end,
                self.data.len()
            )));
        }
        Ok(())
    }
}

impl<T: Clone> VecDataset<T> {
    pub fn to_vec(&self) -> Vec<T> {
        self.data.to_vec()
    }
}

impl<T> Clone for VecDataset<T> {
    fn clone(&self) -> Self {
        Self {
            data: Arc::clone(&self.data),
        }
    }
}

impl<T> From<Vec<T>> for VecDataset<T> {
    fn from(rows: Vec<T>) -> Self {
        Self::new(rows)
    }
}

impl<T> FromIterator<T> for VecDataset<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl<T> Dataset for VecDataset<T>
where
    T: RowFootprint + Send + Sync + 'static,
{
    type Row = T;

    fn len(&self) -> usize {
        self.data.len()
    }

    fn rows(&self, range: Range<usize>) -> Result<Rows<T>> {
        self.check_range(&range)?;
        Ok(Rows::shared(Arc::clone(&self.data), range))
    }

    fn footprint(&self, range: Range<usize>) -> usize {
        let end = range.end.min(self.data.len());
        let start = range.start.min(end);
        self.data[start..end].iter().map(RowFootprint::footprint).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_view_and_detach() {
        let dataset = VecDataset::new((0..10u32).collect());
        let rows = dataset.rows(2..5).unwrap();
        assert_eq!(&*rows, &[2, 3, 4]);
        assert!(rows.is_shared());

        let private = rows.detach();
        assert_eq!(&*private, &[2, 3, 4]);
        assert!(!private.is_shared());
    }

    #[test]
    fn test_out_of_range_rejected() {
        let dataset = VecDataset::new(vec![1u8, 2, 3]);
        assert!(matches!(dataset.rows(1..4), Err(EtlError::InvalidInput(_))));
        assert!(dataset.rows(3..3).unwrap().is_empty());
    }

    #[test]
    fn test_work_unit_range() {
        let unit = WorkUnit::new(3, 30, Rows::owned(vec![1u64; 7]));
        assert_eq!(unit.range(), 30..37);
        assert_eq!(unit.len(), 7);
    }

    #[test]
    fn test_json_footprint_grows_with_content() {
        let small = serde_json::json!({"id": 1});
        let large = serde_json::json!({"id": 1, "payload": "x".repeat(1000)});
        assert!(large.footprint() > small.footprint() + 900);

        let dataset = VecDataset::new(vec![small.clone(), large]);
        assert_eq!(dataset.footprint(0..1), small.footprint());
        assert!(dataset.footprint(0..2) > dataset.footprint(0..1));
    }
}
