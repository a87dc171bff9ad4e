//! Record and batch containers flowing through the data pipeline.
//!
//! A [`Record`] is one raw decoded row: named columns with typed scalar
//! values. Transformation turns it into a [`TransformedRecord`] whose
//! embedding features are index sequences and whose dense features are
//! floats. A [`FeatureBatch`] is the columnar assembly of a fixed number
//! of transformed records, ready for embedding lookup.

use crate::transform::TransformError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A single typed column value in a raw record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    /// UTF-8 string value.
    Str(String),
    /// 64-bit integer value.
    Int(i64),
    /// 64-bit float value.
    Float(f64),
}

impl FieldValue {
    /// Name of the value's type, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldValue::Str(_) => "str",
            FieldValue::Int(_) => "int",
            FieldValue::Float(_) => "float",
        }
    }

    /// Renders the value the way the string-conversion stage does:
    /// integers and floats in their decimal form, strings as-is.
    pub fn render(&self) -> String {
        match self {
            FieldValue::Str(s) => s.clone(),
            FieldValue::Int(i) => i.to_string(),
            FieldValue::Float(f) => f.to_string(),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Str(s) => write!(f, "{}", s),
            FieldValue::Int(i) => write!(f, "{}", i),
            FieldValue::Float(v) => write!(f, "{}", v),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Str(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Str(s)
    }
}

impl From<i64> for FieldValue {
    fn from(i: i64) -> Self {
        FieldValue::Int(i)
    }
}

impl From<f64> for FieldValue {
    fn from(f: f64) -> Self {
        FieldValue::Float(f)
    }
}

/// One raw decoded row: column name to value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    columns: BTreeMap<String, FieldValue>,
}

impl Record {
    /// Creates an empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a column value, replacing any existing value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) {
        self.columns.insert(name.into(), value.into());
    }

    /// Builder-style [`Record::insert`].
    pub fn with(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.insert(name, value);
        self
    }

    /// Looks up a column value.
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.columns.get(name)
    }

    /// Number of columns.
    #[inline]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Whether the record has no columns.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Iterates columns in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.columns.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl FromIterator<(String, FieldValue)> for Record {
    fn from_iter<T: IntoIterator<Item = (String, FieldValue)>>(iter: T) -> Self {
        Self {
            columns: iter.into_iter().collect(),
        }
    }
}

/// A transformed feature value: embedding-table indices or a dense float.
#[derive(Debug, Clone, PartialEq)]
pub enum FeatureValue {
    /// Index sequence for an embedding feature. The length is the
    /// feature's fixed width (`seq_len`, or 1 when unsplit).
    Indices(Vec<i64>),
    /// Casted value of a dense feature.
    Dense(f32),
}

/// The output of transforming one record.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformedRecord {
    /// Feature name to transformed value.
    pub features: BTreeMap<String, FeatureValue>,
    /// Raw values of keep columns, passed through untouched.
    pub kept: BTreeMap<String, FieldValue>,
    /// Extracted supervision label.
    pub label: f32,
}

/// A `[rows, width]` matrix of embedding-table indices in row-major order.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexMatrix {
    width: usize,
    data: Vec<i64>,
}

impl IndexMatrix {
    /// Creates a matrix from row-major data.
    ///
    /// # Panics
    ///
    /// Panics if `data.len()` is not a multiple of `width`.
    pub fn from_rows(width: usize, data: Vec<i64>) -> Self {
        assert!(width > 0, "width must be positive");
        assert_eq!(data.len() % width, 0, "data length must be a multiple of width");
        Self { width, data }
    }

    /// Number of columns per row.
    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    /// Number of rows.
    #[inline]
    pub fn rows(&self) -> usize {
        self.data.len() / self.width
    }

    /// One row of indices.
    pub fn row(&self, row: usize) -> &[i64] {
        &self.data[row * self.width..(row + 1) * self.width]
    }

    /// The raw row-major data.
    pub fn data(&self) -> &[i64] {
        &self.data
    }
}

/// Columnar batch of transformed records.
///
/// All embedding features hold one [`IndexMatrix`] with `batch_size` rows;
/// dense features and labels hold one value per record; keep columns carry
/// their raw values through.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureBatch {
    batch_size: usize,
    indices: BTreeMap<String, IndexMatrix>,
    dense: BTreeMap<String, Vec<f32>>,
    labels: Vec<f32>,
    kept: BTreeMap<String, Vec<FieldValue>>,
}

impl FeatureBatch {
    /// Assembles a batch from transformed records.
    ///
    /// Fails on an empty input or when a feature's width differs between
    /// records (which would mean the transformer produced inconsistent
    /// output for the same schema).
    pub fn from_records(records: Vec<TransformedRecord>) -> Result<Self, TransformError> {
        let batch_size = records.len();
        if batch_size == 0 {
            return Err(TransformError::EmptyBatch);
        }

        let mut indices: BTreeMap<String, IndexMatrix> = BTreeMap::new();
        let mut dense: BTreeMap<String, Vec<f32>> = BTreeMap::new();
        let mut labels = Vec::with_capacity(batch_size);
        let mut kept: BTreeMap<String, Vec<FieldValue>> = BTreeMap::new();

        let mut index_data: BTreeMap<String, (usize, Vec<i64>)> = BTreeMap::new();
        for record in records {
            labels.push(record.label);
            for (name, value) in record.features {
                match value {
                    FeatureValue::Indices(row) => {
                        let entry = index_data
                            .entry(name.clone())
                            .or_insert_with(|| (row.len(), Vec::new()));
                        if row.len() != entry.0 {
                            return Err(TransformError::WidthMismatch {
                                feature: name,
                                expected: entry.0,
                                actual: row.len(),
                            });
                        }
                        entry.1.extend_from_slice(&row);
                    }
                    FeatureValue::Dense(v) => {
                        dense.entry(name).or_default().push(v);
                    }
                }
            }
            for (name, value) in record.kept {
                kept.entry(name).or_default().push(value);
            }
        }

        for (name, (width, data)) in index_data {
            indices.insert(name, IndexMatrix::from_rows(width, data));
        }

        Ok(Self {
            batch_size,
            indices,
            dense,
            labels,
            kept,
        })
    }

    /// Number of records in the batch.
    #[inline]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Index matrix of an embedding feature.
    pub fn indices(&self, feature: &str) -> Option<&IndexMatrix> {
        self.indices.get(feature)
    }

    /// Values of a dense feature, one per record.
    pub fn dense(&self, feature: &str) -> Option<&[f32]> {
        self.dense.get(feature).map(|v| v.as_slice())
    }

    /// Labels, one per record.
    pub fn labels(&self) -> &[f32] {
        &self.labels
    }

    /// Raw values of a keep column, one per record.
    pub fn kept(&self, column: &str) -> Option<&[FieldValue]> {
        self.kept.get(column).map(|v| v.as_slice())
    }

    /// Names of the embedding features present in the batch.
    pub fn index_features(&self) -> impl Iterator<Item = &str> {
        self.indices.keys().map(|k| k.as_str())
    }
}
