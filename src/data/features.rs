//! Per-record feature columns used for grouping and membership filters.
//!
//! Features are the categorical side of a dataset (node type, region, tags).
//! Unlike statistics they may be missing for a record.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use super::dictionary::LabelDictionary;
use super::store::StoreError;

/// Label substituted when a record has no value for a grouping source
pub const MISSING_LABEL: &str = "N/A";

/// One feature value of one record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    Missing,
    Number(f64),
    Text(String),
    Tags(Vec<String>),
}

impl FeatureValue {
    pub fn is_missing(&self) -> bool {
        matches!(self, FeatureValue::Missing)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FeatureValue::Number(v) => Some(*v),
            FeatureValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Group label for this value, `None` when there is nothing to group on
    pub fn label(&self) -> Option<String> {
        match self {
            FeatureValue::Missing => None,
            FeatureValue::Number(v) => Some(format_number(*v)),
            FeatureValue::Text(s) => Some(s.clone()),
            FeatureValue::Tags(tags) if tags.is_empty() => None,
            FeatureValue::Tags(tags) => Some(tags.join(", ")),
        }
    }

    /// The value seen as a set of tags (scalars become a one-element set)
    pub fn tags(&self) -> Vec<String> {
        match self {
            FeatureValue::Missing => Vec::new(),
            FeatureValue::Tags(tags) => tags.clone(),
            other => other.label().into_iter().collect(),
        }
    }

    /// Infer a feature value from JSON
    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => FeatureValue::Missing,
            serde_json::Value::Bool(b) => FeatureValue::Text(b.to_string()),
            serde_json::Value::Number(n) => n
                .as_f64()
                .map(FeatureValue::Number)
                .unwrap_or(FeatureValue::Missing),
            serde_json::Value::String(s) => FeatureValue::Text(s.clone()),
            serde_json::Value::Array(items) => FeatureValue::Tags(
                items
                    .iter()
                    .filter_map(|item| match item {
                        serde_json::Value::String(s) => Some(s.clone()),
                        serde_json::Value::Number(n) => Some(n.to_string()),
                        _ => None,
                    })
                    .collect(),
            ),
            serde_json::Value::Object(_) => FeatureValue::Missing,
        }
    }
}

/// Integral numbers print without a trailing ".0" so labels read naturally
pub(crate) fn format_number(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{}", v)
    }
}

/// Columnar feature storage
#[derive(Debug, Clone)]
pub enum FeatureColumn {
    /// Dictionary-encoded labels
    Categorical {
        codes: Vec<Option<u32>>,
        dictionary: Arc<LabelDictionary>,
    },
    /// Numeric feature (e.g. a capacity band or a year)
    Numeric(Vec<Option<f64>>),
    /// Multi-valued labels sharing one dictionary
    Tags {
        sets: Vec<Vec<u32>>,
        dictionary: Arc<LabelDictionary>,
    },
}

impl FeatureColumn {
    pub fn categorical<S: AsRef<str>>(values: &[Option<S>]) -> Self {
        let dictionary = Arc::new(LabelDictionary::new());
        let codes = values
            .iter()
            .map(|v| v.as_ref().map(|s| dictionary.get_or_insert(s.as_ref())))
            .collect();
        FeatureColumn::Categorical { codes, dictionary }
    }

    pub fn numeric(values: Vec<Option<f64>>) -> Self {
        FeatureColumn::Numeric(values)
    }

    pub fn tags<S: AsRef<str>>(values: &[Vec<S>]) -> Self {
        let dictionary = Arc::new(LabelDictionary::new());
        let sets = values
            .iter()
            .map(|set| {
                set.iter()
                    .map(|s| dictionary.get_or_insert(s.as_ref()))
                    .collect()
            })
            .collect();
        FeatureColumn::Tags { sets, dictionary }
    }

    pub fn len(&self) -> usize {
        match self {
            FeatureColumn::Categorical { codes, .. } => codes.len(),
            FeatureColumn::Numeric(v) => v.len(),
            FeatureColumn::Tags { sets, .. } => sets.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Value at index; out-of-range reads as missing
    pub fn get(&self, index: usize) -> FeatureValue {
        match self {
            FeatureColumn::Categorical { codes, dictionary } => codes
                .get(index)
                .and_then(|c| *c)
                .and_then(|c| dictionary.get_label(c))
                .map(FeatureValue::Text)
                .unwrap_or(FeatureValue::Missing),
            FeatureColumn::Numeric(v) => v
                .get(index)
                .and_then(|v| *v)
                .filter(|v| !v.is_nan())
                .map(FeatureValue::Number)
                .unwrap_or(FeatureValue::Missing),
            FeatureColumn::Tags { sets, dictionary } => match sets.get(index) {
                Some(set) => FeatureValue::Tags(
                    set.iter().filter_map(|c| dictionary.get_label(*c)).collect(),
                ),
                None => FeatureValue::Missing,
            },
        }
    }

    /// Group label at index, with the placeholder for missing data
    pub fn label(&self, index: usize) -> String {
        self.get(index)
            .label()
            .unwrap_or_else(|| MISSING_LABEL.to_string())
    }
}

/// Named feature columns aligned with a [`super::ValueStore`]
#[derive(Debug, Clone, Default)]
pub struct FeatureTable {
    columns: HashMap<String, FeatureColumn>,
    len: usize,
}

impl FeatureTable {
    pub fn new(len: usize) -> Self {
        Self {
            columns: HashMap::new(),
            len,
        }
    }

    /// Add a column; its length must match the table's
    pub fn insert(&mut self, name: impl Into<String>, column: FeatureColumn) -> Result<(), StoreError> {
        let name = name.into();
        if column.len() != self.len {
            return Err(StoreError::InconsistentShape {
                name,
                expected: self.len,
                actual: column.len(),
            });
        }
        self.columns.insert(name, column);
        Ok(())
    }

    /// Builder-style [`FeatureTable::insert`]
    pub fn with_column(mut self, name: impl Into<String>, column: FeatureColumn) -> Result<Self, StoreError> {
        self.insert(name, column)?;
        Ok(self)
    }

    /// Build from JSON records, inferring each column's kind from its values
    pub fn from_json_rows(rows: &[serde_json::Map<String, serde_json::Value>]) -> Self {
        let mut values: HashMap<String, Vec<FeatureValue>> = HashMap::new();
        for (i, row) in rows.iter().enumerate() {
            for (key, json) in row {
                let column = values
                    .entry(key.clone())
                    .or_insert_with(|| vec![FeatureValue::Missing; i]);
                column.resize(i, FeatureValue::Missing);
                column.push(FeatureValue::from_json(json));
            }
        }

        let mut table = FeatureTable::new(rows.len());
        for (name, mut column) in values {
            column.resize(rows.len(), FeatureValue::Missing);
            table.columns.insert(name, column_from_values(&column));
        }
        table
    }

    pub fn get(&self, name: &str) -> Option<&FeatureColumn> {
        self.columns.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    /// Feature value of one record; an absent feature reads as missing
    pub fn value(&self, name: &str, index: usize) -> FeatureValue {
        self.columns
            .get(name)
            .map(|c| c.get(index))
            .unwrap_or(FeatureValue::Missing)
    }

    /// Group label of one record, never failing
    pub fn label(&self, name: &str, index: usize) -> String {
        self.columns
            .get(name)
            .map(|c| c.label(index))
            .unwrap_or_else(|| MISSING_LABEL.to_string())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.columns.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Pick a column representation for inferred values
fn column_from_values(values: &[FeatureValue]) -> FeatureColumn {
    let has_tags = values.iter().any(|v| matches!(v, FeatureValue::Tags(_)));
    let all_numeric = values
        .iter()
        .all(|v| matches!(v, FeatureValue::Number(_) | FeatureValue::Missing));

    if has_tags {
        let sets: Vec<Vec<String>> = values.iter().map(|v| v.tags()).collect();
        FeatureColumn::tags(&sets)
    } else if all_numeric {
        FeatureColumn::numeric(values.iter().map(|v| v.as_f64()).collect())
    } else {
        let labels: Vec<Option<String>> = values.iter().map(|v| v.label()).collect();
        FeatureColumn::categorical(&labels)
    }
}
