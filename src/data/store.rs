//! Immutable columnar store of per-record statistic values.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Process-wide counter so every dataset load gets a distinct generation
static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Statistic name -> dense value buffer, all buffers sharing one length.
///
/// Buffers are reference counted so worker threads can read them without
/// copying. There is no mutation API: a new dataset load builds a new store.
#[derive(Debug, Clone)]
pub struct ValueStore {
    columns: HashMap<String, Arc<[f64]>>,
    /// Column names in the order they were supplied
    names: Vec<String>,
    len: usize,
    generation: u64,
}

impl ValueStore {
    /// Build a store from owned buffers. Fails if lengths disagree.
    pub fn new(columns: HashMap<String, Vec<f64>>) -> Result<Self, StoreError> {
        let mut names: Vec<String> = columns.keys().cloned().collect();
        names.sort();

        let mut builder = ValueStoreBuilder::new();
        let mut columns = columns;
        for name in names {
            if let Some(values) = columns.remove(&name) {
                builder = builder.column(name, values);
            }
        }
        builder.build()
    }

    /// An empty store with no statistics
    pub fn empty() -> Self {
        Self {
            columns: HashMap::new(),
            names: Vec::new(),
            len: 0,
            generation: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Values of one statistic
    pub fn get(&self, name: &str) -> Result<&[f64], StoreError> {
        self.columns
            .get(name)
            .map(|c| c.as_ref())
            .ok_or_else(|| StoreError::UnknownStatistic(name.to_string()))
    }

    /// Shared handle to one statistic's buffer
    pub fn shared(&self, name: &str) -> Result<Arc<[f64]>, StoreError> {
        self.columns
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::UnknownStatistic(name.to_string()))
    }

    /// Value of a statistic at one record. Out-of-range indices read as NaN.
    #[inline]
    pub fn value_at(&self, name: &str, index: usize) -> Result<f64, StoreError> {
        Ok(self.get(name)?.get(index).copied().unwrap_or(f64::NAN))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of statistics
    pub fn statistic_count(&self) -> usize {
        self.names.len()
    }

    /// Identifies the dataset load this store came from
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// All record indices, in order
    pub fn all_indices(&self) -> Vec<usize> {
        (0..self.len).collect()
    }

    /// Approximate heap usage of the value buffers
    pub fn memory_usage(&self) -> usize {
        self.columns.values().map(|c| c.len() * std::mem::size_of::<f64>()).sum()
    }
}

/// Incremental construction of a [`ValueStore`], preserving column order
#[derive(Debug, Default)]
pub struct ValueStoreBuilder {
    columns: Vec<(String, Vec<f64>)>,
}

impl ValueStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a statistic column
    pub fn column(mut self, name: impl Into<String>, values: Vec<f64>) -> Self {
        let name = name.into();
        if let Some(existing) = self.columns.iter_mut().find(|(n, _)| *n == name) {
            existing.1 = values;
        } else {
            self.columns.push((name, values));
        }
        self
    }

    pub fn build(self) -> Result<ValueStore, StoreError> {
        let len = self.columns.first().map(|(_, v)| v.len()).unwrap_or(0);

        let mut columns = HashMap::with_capacity(self.columns.len());
        let mut names = Vec::with_capacity(self.columns.len());

        for (name, values) in self.columns {
            if values.len() != len {
                return Err(StoreError::InconsistentShape {
                    name,
                    expected: len,
                    actual: values.len(),
                });
            }
            names.push(name.clone());
            columns.insert(name, Arc::from(values));
        }

        Ok(ValueStore {
            columns,
            names,
            len,
            generation: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
        })
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("Unknown statistic '{0}'")]
    UnknownStatistic(String),

    #[error("Statistic '{name}' has {actual} values, expected {expected}")]
    InconsistentShape {
        name: String,
        expected: usize,
        actual: usize,
    },
}
