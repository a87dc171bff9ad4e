//! Record transformation: raw columns to embedding indices and dense values.
//!
//! [`RecordTransformer`] compiles the feature schema into a per-feature
//! plan once, then applies it to any number of records. The stages run in
//! a fixed order for every feature:
//!
//! 1. type coercion against the declared column type
//! 2. `convert_to_string`
//! 3. `split_by_space` (empty tokens become `"0"`, rows are right-padded
//!    with `"0"` and truncated to `seq_len`)
//! 4. `convert_to_int_after_split`
//! 5. `hash` into `[0, vocab_size)`
//! 6. vocabulary substitution (reuse resolved)
//!
//! Transformation is pure: the transformer is `Send + Sync` and one
//! instance can serve any number of worker threads. Every failure carries
//! the feature name so a bad record can be traced back to its column.

use crate::record::{FeatureValue, FieldValue, Record, TransformedRecord};
use crate::vocab::{VocabularyStore, VocabularyTable};
use rayon::prelude::*;
use recall_core::config::{ColumnType, Config, FeatureKind};
use recall_core::fingerprint::bucket;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while transforming records.
#[derive(Error, Debug)]
pub enum TransformError {
    /// The record has no column for a schema feature.
    #[error("feature '{feature}': record has no column '{column}'")]
    MissingColumn {
        /// The feature being transformed.
        feature: String,
        /// The absent column.
        column: String,
    },

    /// A column value does not match its declared type.
    #[error("column '{column}': declared {expected}, got {actual}")]
    TypeMismatch {
        /// The offending column.
        column: String,
        /// The declared column type.
        expected: &'static str,
        /// The value's actual type.
        actual: &'static str,
    },

    /// A token could not be parsed as an integer after splitting.
    #[error("feature '{feature}': token '{token}' is not an integer")]
    ParseInt {
        /// The feature being transformed.
        feature: String,
        /// The unparseable token.
        token: String,
    },

    /// The hash stage received a non-string value.
    #[error("feature '{feature}': hash stage needs a string value, got {actual}")]
    NotHashable {
        /// The feature being transformed.
        feature: String,
        /// The value's actual type.
        actual: &'static str,
    },

    /// An embedding feature produced a value that is not an index.
    #[error("feature '{feature}': {actual} value cannot index an embedding table")]
    NotIndexable {
        /// The feature being transformed.
        feature: String,
        /// The value's actual type.
        actual: &'static str,
    },

    /// A dense feature held a non-numeric value.
    #[error("dense feature '{feature}' holds a {actual} value")]
    NotNumeric {
        /// The feature being transformed.
        feature: String,
        /// The value's actual type.
        actual: &'static str,
    },

    /// The label column is declared with a non-numeric type.
    #[error("label column '{column}' must be int or float, declared {declared}")]
    LabelNotNumeric {
        /// The label column.
        column: String,
        /// Its declared type.
        declared: &'static str,
    },

    /// The schema references a column the transformer was not built with.
    #[error("column '{column}' is not declared in dataset_features")]
    UndeclaredColumn {
        /// The missing column.
        column: String,
    },

    /// A feature needed a vocabulary that was not loaded.
    #[error("feature '{feature}' resolves to a vocabulary that is not loaded")]
    MissingVocabulary {
        /// The feature being transformed.
        feature: String,
    },

    /// Batch assembly was handed zero records.
    #[error("cannot assemble a batch from zero records")]
    EmptyBatch,

    /// A feature's width differed between records of one batch.
    #[error("feature '{feature}': width {actual} differs from {expected}")]
    WidthMismatch {
        /// The inconsistent feature.
        feature: String,
        /// Width of the first record.
        expected: usize,
        /// Width of the offending record.
        actual: usize,
    },
}

/// Result alias for transformation.
pub type Result<T> = std::result::Result<T, TransformError>;

/// A value mid-pipeline: a scalar, or a token/index sequence after split.
enum Staged {
    Str(String),
    Int(i64),
    Float(f64),
    StrSeq(Vec<String>),
    IntSeq(Vec<i64>),
}

impl Staged {
    fn type_name(&self) -> &'static str {
        match self {
            Staged::Str(_) | Staged::StrSeq(_) => "str",
            Staged::Int(_) | Staged::IntSeq(_) => "int",
            Staged::Float(_) => "float",
        }
    }
}

#[derive(Debug)]
enum FeaturePlan {
    Embedding {
        convert_to_string: bool,
        split: Option<usize>,
        convert_to_int_after_split: bool,
        hash_buckets: Option<u64>,
        vocab: Option<Arc<VocabularyTable>>,
    },
    Dense,
}

/// Compiled, shareable record transformation for one configuration.
#[derive(Debug)]
pub struct RecordTransformer {
    plans: Vec<(String, FeaturePlan)>,
    column_types: BTreeMap<String, ColumnType>,
    label_column: String,
    keep_columns: Vec<String>,
}

impl RecordTransformer {
    /// Compiles the transformation plan for a validated configuration.
    pub fn new(config: &Config, vocabs: &VocabularyStore) -> Result<Self> {
        let label_type =
            config
                .dataset_features
                .get(&config.label)
                .ok_or_else(|| TransformError::UndeclaredColumn {
                    column: config.label.clone(),
                })?;
        if label_type.column_type == ColumnType::Str {
            return Err(TransformError::LabelNotNumeric {
                column: config.label.clone(),
                declared: label_type.column_type.name(),
            });
        }

        let mut plans = Vec::new();
        for (name, feature) in &config.model.features {
            if !config.dataset_features.contains_key(name) {
                return Err(TransformError::UndeclaredColumn {
                    column: name.clone(),
                });
            }
            let plan = match &feature.kind {
                FeatureKind::Dense => FeaturePlan::Dense,
                FeatureKind::EmbeddingLookup(embedding) => {
                    let vocab = match config.vocab_owner(name) {
                        Some(_) => Some(Arc::clone(vocabs.table(name).ok_or_else(|| {
                            TransformError::MissingVocabulary {
                                feature: name.clone(),
                            }
                        })?)),
                        None => None,
                    };
                    FeaturePlan::Embedding {
                        convert_to_string: feature.convert_to_string,
                        split: if embedding.split_by_space {
                            embedding.seq_len
                        } else {
                            None
                        },
                        convert_to_int_after_split: embedding.convert_to_int_after_split,
                        hash_buckets: if embedding.hash {
                            embedding.vocab_size.map(|v| v as u64)
                        } else {
                            None
                        },
                        vocab,
                    }
                }
            };
            plans.push((name.clone(), plan));
        }

        let keep_columns = config
            .dataset_features
            .iter()
            .filter(|(_, c)| c.keep)
            .map(|(name, _)| name.clone())
            .collect();

        Ok(Self {
            plans,
            column_types: config
                .dataset_features
                .iter()
                .map(|(name, c)| (name.clone(), c.column_type))
                .collect(),
            label_column: config.label.clone(),
            keep_columns,
        })
    }

    /// Transforms one record. Pure with respect to `&self`.
    pub fn transform(&self, record: &Record) -> Result<TransformedRecord> {
        let mut features = BTreeMap::new();
        for (name, plan) in &self.plans {
            let staged = self.coerce(name, name, record)?;
            let value = match plan {
                FeaturePlan::Dense => match staged {
                    Staged::Int(i) => FeatureValue::Dense(i as f32),
                    Staged::Float(f) => FeatureValue::Dense(f as f32),
                    other => {
                        return Err(TransformError::NotNumeric {
                            feature: name.clone(),
                            actual: other.type_name(),
                        })
                    }
                },
                FeaturePlan::Embedding {
                    convert_to_string,
                    split,
                    convert_to_int_after_split,
                    hash_buckets,
                    vocab,
                } => {
                    let mut staged = staged;
                    if *convert_to_string {
                        staged = to_string_stage(staged);
                    }
                    if let Some(seq_len) = split {
                        staged = split_stage(name, staged, *seq_len)?;
                    }
                    if *convert_to_int_after_split {
                        staged = parse_int_stage(name, staged)?;
                    }
                    if let Some(buckets) = hash_buckets {
                        staged = hash_stage(name, staged, *buckets)?;
                    }
                    if let Some(table) = vocab {
                        staged = vocab_stage(staged, table);
                    }
                    finalize_indices(name, staged)?
                }
            };
            features.insert(name.clone(), value);
        }

        let label = self.extract_label(record)?;
        let mut kept = BTreeMap::new();
        for column in &self.keep_columns {
            let value = record
                .get(column)
                .ok_or_else(|| TransformError::MissingColumn {
                    feature: column.clone(),
                    column: column.clone(),
                })?;
            kept.insert(column.clone(), value.clone());
        }

        Ok(TransformedRecord {
            features,
            kept,
            label,
        })
    }

    /// Transforms a slice of records in parallel, preserving order.
    pub fn transform_batch(&self, records: &[Record]) -> Result<Vec<TransformedRecord>> {
        records
            .par_iter()
            .map(|record| self.transform(record))
            .collect()
    }

    /// The column the label is extracted from.
    #[inline]
    pub fn label_column(&self) -> &str {
        &self.label_column
    }

    /// Columns passed through untouched.
    pub fn keep_columns(&self) -> &[String] {
        &self.keep_columns
    }

    fn coerce(&self, feature: &str, column: &str, record: &Record) -> Result<Staged> {
        let declared =
            self.column_types
                .get(column)
                .ok_or_else(|| TransformError::UndeclaredColumn {
                    column: column.to_string(),
                })?;
        let value = record
            .get(column)
            .ok_or_else(|| TransformError::MissingColumn {
                feature: feature.to_string(),
                column: column.to_string(),
            })?;
        match (declared, value) {
            (ColumnType::Str, FieldValue::Str(s)) => Ok(Staged::Str(s.clone())),
            (ColumnType::Int, FieldValue::Int(i)) => Ok(Staged::Int(*i)),
            (ColumnType::Float, FieldValue::Float(f)) => Ok(Staged::Float(*f)),
            // Integers are exact in a float column.
            (ColumnType::Float, FieldValue::Int(i)) => Ok(Staged::Float(*i as f64)),
            (declared, value) => Err(TransformError::TypeMismatch {
                column: column.to_string(),
                expected: declared.name(),
                actual: value.type_name(),
            }),
        }
    }

    fn extract_label(&self, record: &Record) -> Result<f32> {
        match self.coerce(&self.label_column, &self.label_column, record)? {
            Staged::Int(i) => Ok(i as f32),
            Staged::Float(f) => Ok(f as f32),
            other => Err(TransformError::LabelNotNumeric {
                column: self.label_column.clone(),
                declared: other.type_name(),
            }),
        }
    }
}

fn to_string_stage(staged: Staged) -> Staged {
    match staged {
        Staged::Int(i) => Staged::Str(i.to_string()),
        Staged::Float(f) => Staged::Str(f.to_string()),
        other => other,
    }
}

/// The padding token. Empty tokens are replaced with it, short rows are
/// right-padded with it, and an empty input becomes a full row of it.
const SENTINEL: &str = "0";

fn split_stage(feature: &str, staged: Staged, seq_len: usize) -> Result<Staged> {
    let text = match staged {
        Staged::Str(s) => s,
        other => {
            return Err(TransformError::TypeMismatch {
                column: feature.to_string(),
                expected: "str",
                actual: other.type_name(),
            })
        }
    };
    let mut tokens: Vec<String> = text
        .split(' ')
        .map(|t| {
            if t.is_empty() {
                SENTINEL.to_string()
            } else {
                t.to_string()
            }
        })
        .collect();
    tokens.truncate(seq_len);
    while tokens.len() < seq_len {
        tokens.push(SENTINEL.to_string());
    }
    Ok(Staged::StrSeq(tokens))
}

fn parse_int_stage(feature: &str, staged: Staged) -> Result<Staged> {
    match staged {
        Staged::StrSeq(tokens) => {
            let mut out = Vec::with_capacity(tokens.len());
            for token in tokens {
                let parsed = token.parse::<i64>().map_err(|_| TransformError::ParseInt {
                    feature: feature.to_string(),
                    token: token.clone(),
                })?;
                out.push(parsed);
            }
            Ok(Staged::IntSeq(out))
        }
        Staged::Str(token) => {
            let parsed = token.parse::<i64>().map_err(|_| TransformError::ParseInt {
                feature: feature.to_string(),
                token: token.clone(),
            })?;
            Ok(Staged::Int(parsed))
        }
        other => Ok(other),
    }
}

fn hash_stage(feature: &str, staged: Staged, buckets: u64) -> Result<Staged> {
    match staged {
        Staged::Str(s) => Ok(Staged::Int(bucket(s.as_bytes(), buckets) as i64)),
        Staged::StrSeq(tokens) => Ok(Staged::IntSeq(
            tokens
                .iter()
                .map(|t| bucket(t.as_bytes(), buckets) as i64)
                .collect(),
        )),
        other => Err(TransformError::NotHashable {
            feature: feature.to_string(),
            actual: other.type_name(),
        }),
    }
}

fn vocab_stage(staged: Staged, table: &VocabularyTable) -> Staged {
    match staged {
        Staged::Str(s) => Staged::Int(table.lookup(&s)),
        Staged::StrSeq(tokens) => {
            Staged::IntSeq(tokens.iter().map(|t| table.lookup(t)).collect())
        }
        Staged::Int(i) => Staged::Int(table.lookup(&i.to_string())),
        Staged::IntSeq(seq) => {
            Staged::IntSeq(seq.iter().map(|i| table.lookup(&i.to_string())).collect())
        }
        other => other,
    }
}

fn finalize_indices(feature: &str, staged: Staged) -> Result<FeatureValue> {
    match staged {
        Staged::Int(i) => Ok(FeatureValue::Indices(vec![i])),
        Staged::IntSeq(seq) => Ok(FeatureValue::Indices(seq)),
        other => Err(TransformError::NotIndexable {
            feature: feature.to_string(),
            actual: other.type_name(),
        }),
    }
}
