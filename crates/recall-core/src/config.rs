//! Declarative configuration for the two-tower scoring engine.
//!
//! A single YAML document drives the whole engine: which dataset columns
//! exist, which of them become model features, how each feature is turned
//! into embedding-table indices, and how the two towers are assembled.
//! [`Config::validate`] checks every cross-field rule up front so that a
//! bad document fails before any data is read or any table is allocated.
//!
//! # Example
//!
//! ```
//! use recall_core::config::Config;
//!
//! let config = Config::from_yaml_str(r#"
//! epochs: 2
//! global_batch_size: 4
//! drop_remainder: true
//! label: clicked
//! cycle_length: 2
//! format: csv
//! model:
//!   loss: bce
//!   features:
//!     user_id:
//!       type: embedding_lookup
//!       belongs_to: user
//!       hash: true
//!       vocab_size: 1000
//!       embedding_dim: 8
//!     post_id:
//!       type: embedding_lookup
//!       belongs_to: post
//!       hash: true
//!       vocab_size: 1000
//!       embedding_dim: 8
//! dataset_features:
//!   user_id: { type: str }
//!   post_id: { type: str }
//!   clicked: { type: int }
//! "#).unwrap();
//! config.validate().unwrap();
//! assert_eq!(config.model.features.len(), 2);
//! ```

use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Which side of the two-tower model a feature feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tower {
    /// The user (query) tower.
    User,
    /// The post (candidate item) tower.
    Post,
}

impl Tower {
    /// Both towers, in a fixed order.
    pub const ALL: [Tower; 2] = [Tower::User, Tower::Post];
}

impl fmt::Display for Tower {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tower::User => write!(f, "user"),
            Tower::Post => write!(f, "post"),
        }
    }
}

/// Declared type of a raw dataset column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    /// UTF-8 string column.
    Str,
    /// 64-bit integer column.
    Int,
    /// 64-bit float column.
    Float,
}

impl ColumnType {
    /// Name used in error messages.
    pub fn name(&self) -> &'static str {
        match self {
            ColumnType::Str => "str",
            ColumnType::Int => "int",
            ColumnType::Float => "float",
        }
    }
}

/// Training objective. Scores pass through a sigmoid unless the loss is
/// squared error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    /// Binary cross entropy on sigmoid scores.
    Bce,
    /// Mean squared error on raw scores.
    Mse,
}

impl Default for LossKind {
    fn default() -> Self {
        LossKind::Bce
    }
}

/// How a sequence of embedding vectors is reduced to a single vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombineMode {
    /// Element-wise sum over the sequence positions.
    Sum,
    /// Self-attention pooling followed by a dense projection.
    Attention,
}

impl Default for CombineMode {
    fn default() -> Self {
        CombineMode::Sum
    }
}

/// Physical layout of the embedding parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingBackendKind {
    /// One weight matrix and one bias column per table.
    PerFeature,
    /// A single matrix per table whose last column is the bias.
    Unified,
}

impl Default for EmbeddingBackendKind {
    fn default() -> Self {
        EmbeddingBackendKind::PerFeature
    }
}

/// Source format of the training data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFormat {
    /// Delimited text files with a header row.
    Csv,
    /// Length-delimited record files (reader supplied by the caller).
    RecordFile,
    /// Columnar files (reader supplied by the caller).
    ColumnarFile,
    /// A warehouse table scanned with a deterministic shard predicate.
    WarehouseTable,
}

impl SourceFormat {
    /// Whether this format reads a set of files (as opposed to a table scan).
    pub fn is_file_based(&self) -> bool {
        !matches!(self, SourceFormat::WarehouseTable)
    }
}

/// Stream compression applied to source and vocabulary files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    /// Gzip-compressed files.
    Gzip,
}

/// Options for a feature that is looked up in an embedding table.
///
/// All fields are optional in the document; [`Config::validate`] enforces
/// the combinations that make sense (`hash` needs `vocab_size`,
/// `vocab_path` needs `num_oov_buckets`, `split_by_space` needs `seq_len`,
/// and a feature that does not reuse another feature's table needs both
/// `embedding_dim` and `vocab_size`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingFeature {
    /// Width of the embedding vectors. Required unless `reuse_embedding`.
    pub embedding_dim: Option<usize>,
    /// Number of in-vocabulary rows in the table.
    pub vocab_size: Option<usize>,
    /// Hash raw string values into `[0, vocab_size)`.
    pub hash: bool,
    /// Two-column `token,index` vocabulary file.
    pub vocab_path: Option<PathBuf>,
    /// Out-of-vocabulary buckets appended past the vocabulary range.
    pub num_oov_buckets: Option<usize>,
    /// Use the vocabulary loaded for another feature.
    pub reuse_vocab: Option<String>,
    /// Use the embedding table owned by another feature.
    pub reuse_embedding: Option<String>,
    /// Split the string value on whitespace into a token sequence.
    pub split_by_space: bool,
    /// Fixed sequence width after padding/truncation. Required with
    /// `split_by_space`.
    pub seq_len: Option<usize>,
    /// Parse each token to an integer after splitting.
    pub convert_to_int_after_split: bool,
    /// Reduction from `[batch, seq_len, dim]` to `[batch, dim]`.
    pub combine_mode: CombineMode,
}

impl EmbeddingFeature {
    /// Number of index positions this feature produces per record.
    pub fn width(&self) -> usize {
        self.seq_len.unwrap_or(1)
    }

    /// Total rows an owning table needs: the vocabulary plus any
    /// out-of-vocabulary buckets. Hash features map straight into
    /// `[0, vocab_size)` and need no extra rows.
    ///
    /// Returns `None` when `vocab_size` is not declared (reuse features).
    pub fn index_space(&self) -> Option<usize> {
        let vocab_size = self.vocab_size?;
        if self.hash {
            Some(vocab_size)
        } else {
            Some(vocab_size + self.num_oov_buckets.unwrap_or(0))
        }
    }
}

/// How a feature is derived from its dataset column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeatureKind {
    /// Categorical feature resolved to embedding-table indices.
    EmbeddingLookup(EmbeddingFeature),
    /// Numeric feature passed to the tower input as-is.
    Dense,
}

/// A single model feature: its derivation plus which tower consumes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureConfig {
    /// Derivation of indices (or pass-through for dense features).
    #[serde(flatten)]
    pub kind: FeatureKind,
    /// Which tower this feature feeds.
    pub belongs_to: Tower,
    /// Render the raw value to its decimal string before later stages.
    #[serde(default)]
    pub convert_to_string: bool,
}

impl FeatureConfig {
    /// Embedding options, or `None` for a dense feature.
    pub fn embedding(&self) -> Option<&EmbeddingFeature> {
        match &self.kind {
            FeatureKind::EmbeddingLookup(e) => Some(e),
            FeatureKind::Dense => None,
        }
    }

    /// Whether this is a dense (pass-through) feature.
    #[inline]
    pub fn is_dense(&self) -> bool {
        matches!(self.kind, FeatureKind::Dense)
    }
}

/// A raw dataset column: its type and how it flows through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ColumnConfig {
    /// Declared value type, used for decoding and coercion.
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    /// Marks the column used by the warehouse shard predicate.
    #[serde(default)]
    pub use_for_sampling: bool,
    /// Carry the raw value through transformation untouched.
    #[serde(default)]
    pub keep: bool,
}

/// Model half of the configuration: loss, regularization, towers, features.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Step size handed to the (external) optimizer.
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,
    /// Training objective.
    #[serde(default)]
    pub loss: LossKind,
    /// Coefficient of the L1 term over embedding parameters.
    #[serde(default)]
    pub l1_regularization: f32,
    /// Coefficient of the L2 term over embedding parameters.
    #[serde(default)]
    pub l2_regularization: f32,
    /// Dropout rate applied to tower inputs during training.
    #[serde(default)]
    pub dropout: Option<f32>,
    /// Hidden/output widths of the user tower projection. Empty for none.
    #[serde(default)]
    pub user_linear_units: Vec<usize>,
    /// Hidden/output widths of the post tower projection. Empty for none.
    #[serde(default)]
    pub post_linear_units: Vec<usize>,
    /// Physical layout of embedding parameters.
    #[serde(default)]
    pub embedding_backend: EmbeddingBackendKind,
    /// Model features by name. Every name must also appear in
    /// `dataset_features`.
    pub features: BTreeMap<String, FeatureConfig>,
}

fn default_learning_rate() -> f32 {
    0.05
}

fn default_cycle_length() -> usize {
    1
}

/// Root configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Number of passes over the sharded input.
    pub epochs: usize,
    /// Records per emitted batch.
    pub global_batch_size: usize,
    /// Drop batches shorter than `global_batch_size`.
    #[serde(default)]
    pub drop_remainder: bool,
    /// Dataset column holding the supervision label.
    pub label: String,
    /// Size of the record shuffle buffer. `None` disables shuffling.
    #[serde(default)]
    pub shuffle_buffer_size: Option<usize>,
    /// Number of source streams read round-robin.
    #[serde(default = "default_cycle_length")]
    pub cycle_length: usize,
    /// Source data format.
    pub format: SourceFormat,
    /// Compression of source files.
    #[serde(default)]
    pub compression: Option<Compression>,
    /// Model configuration.
    pub model: ModelConfig,
    /// Raw dataset columns by name.
    pub dataset_features: BTreeMap<String, ColumnConfig>,
}

impl Config {
    /// Parses a configuration from a YAML string. The result is not yet
    /// validated; call [`Config::validate`] before building anything on it.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Reads and parses a configuration document from disk.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    /// Checks every cross-field rule and returns the first violation.
    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 {
            return Err(ConfigError::NonPositive { field: "epochs" });
        }
        if self.global_batch_size == 0 {
            return Err(ConfigError::NonPositive {
                field: "global_batch_size",
            });
        }
        if self.cycle_length == 0 {
            return Err(ConfigError::NonPositive {
                field: "cycle_length",
            });
        }
        if !self.dataset_features.contains_key(&self.label) {
            return Err(ConfigError::UnknownLabel {
                label: self.label.clone(),
            });
        }
        if let Some(rate) = self.model.dropout {
            if !(0.0..1.0).contains(&rate) {
                return Err(ConfigError::Invalid {
                    message: format!("dropout must be in [0, 1), got {}", rate),
                });
            }
        }

        let sampling: Vec<&String> = self
            .dataset_features
            .iter()
            .filter(|(_, c)| c.use_for_sampling)
            .map(|(name, _)| name)
            .collect();
        if sampling.len() > 1 {
            return Err(ConfigError::Invalid {
                message: format!(
                    "only one column may set use_for_sampling, found {:?}",
                    sampling
                ),
            });
        }
        if self.format == SourceFormat::WarehouseTable && sampling.is_empty() {
            return Err(ConfigError::Invalid {
                message: "warehouse_table sources need a column with use_for_sampling".to_string(),
            });
        }

        for (name, feature) in &self.model.features {
            self.validate_feature(name, feature)?;
        }

        for tower in Tower::ALL {
            if !self.model.features.values().any(|f| f.belongs_to == tower) {
                return Err(ConfigError::EmptyTower {
                    tower: tower.to_string(),
                });
            }
        }

        Ok(())
    }

    fn validate_feature(&self, name: &str, feature: &FeatureConfig) -> Result<()> {
        if !self.dataset_features.contains_key(name) {
            return Err(ConfigError::UnknownColumn {
                feature: name.to_string(),
            });
        }

        let embedding = match feature.embedding() {
            Some(e) => e,
            None => return Ok(()),
        };

        if embedding.hash && embedding.vocab_size.is_none() {
            return Err(ConfigError::MissingField {
                feature: name.to_string(),
                field: "hash",
                requires: "vocab_size",
            });
        }
        if embedding.hash && embedding.vocab_path.is_some() {
            // Legal, but the hashed buckets then go through the vocabulary
            // lookup, where they rarely match a real token.
            warn!(
                feature = name,
                "feature sets both hash and vocab_path; the hashed buckets are looked up in the \
                 vocabulary and will mostly map to OOV"
            );
        }
        if embedding.vocab_path.is_some() && embedding.num_oov_buckets.is_none() {
            return Err(ConfigError::MissingField {
                feature: name.to_string(),
                field: "vocab_path",
                requires: "num_oov_buckets",
            });
        }
        if embedding.split_by_space && embedding.seq_len.is_none() {
            return Err(ConfigError::MissingField {
                feature: name.to_string(),
                field: "split_by_space",
                requires: "seq_len",
            });
        }
        for (field, value) in [
            ("embedding_dim", embedding.embedding_dim),
            ("vocab_size", embedding.vocab_size),
            ("num_oov_buckets", embedding.num_oov_buckets),
            ("seq_len", embedding.seq_len),
        ] {
            if value == Some(0) {
                return Err(ConfigError::Invalid {
                    message: format!("feature '{}': {} must be positive", name, field),
                });
            }
        }

        if let Some(target) = &embedding.reuse_vocab {
            let target_feature = self.model.features.get(target).ok_or_else(|| {
                ConfigError::UnknownReference {
                    feature: name.to_string(),
                    field: "reuse_vocab",
                    target: target.clone(),
                }
            })?;
            let target_embedding =
                target_feature
                    .embedding()
                    .ok_or_else(|| ConfigError::InvalidReuse {
                        feature: name.to_string(),
                        target: target.clone(),
                        reason: "target is a dense feature".to_string(),
                    })?;
            if target_embedding.vocab_path.is_none() {
                return Err(ConfigError::InvalidReuse {
                    feature: name.to_string(),
                    target: target.clone(),
                    reason: "target declares no vocab_path".to_string(),
                });
            }
            if target_embedding.reuse_vocab.is_some() {
                return Err(ConfigError::InvalidReuse {
                    feature: name.to_string(),
                    target: target.clone(),
                    reason: "target reuses a vocabulary itself".to_string(),
                });
            }
        }

        match &embedding.reuse_embedding {
            None => {
                if embedding.embedding_dim.is_none() {
                    return Err(ConfigError::MissingField {
                        feature: name.to_string(),
                        field: "embedding_lookup",
                        requires: "embedding_dim",
                    });
                }
                if embedding.vocab_size.is_none() {
                    return Err(ConfigError::MissingField {
                        feature: name.to_string(),
                        field: "embedding_lookup",
                        requires: "vocab_size",
                    });
                }
            }
            Some(target) => {
                let target_feature = self.model.features.get(target).ok_or_else(|| {
                    ConfigError::UnknownReference {
                        feature: name.to_string(),
                        field: "reuse_embedding",
                        target: target.clone(),
                    }
                })?;
                let target_embedding =
                    target_feature
                        .embedding()
                        .ok_or_else(|| ConfigError::InvalidReuse {
                            feature: name.to_string(),
                            target: target.clone(),
                            reason: "target is a dense feature".to_string(),
                        })?;
                if target_embedding.reuse_embedding.is_some() {
                    return Err(ConfigError::InvalidReuse {
                        feature: name.to_string(),
                        target: target.clone(),
                        reason: "target reuses an embedding table itself".to_string(),
                    });
                }
                if target_embedding.embedding_dim.is_none() || target_embedding.vocab_size.is_none()
                {
                    return Err(ConfigError::InvalidReuse {
                        feature: name.to_string(),
                        target: target.clone(),
                        reason: "target declares no embedding_dim/vocab_size".to_string(),
                    });
                }
                if let (Some(own), Some(theirs)) =
                    (embedding.embedding_dim, target_embedding.embedding_dim)
                {
                    if own != theirs {
                        return Err(ConfigError::InvalidReuse {
                            feature: name.to_string(),
                            target: target.clone(),
                            reason: format!(
                                "embedding_dim {} conflicts with target's {}",
                                own, theirs
                            ),
                        });
                    }
                }
            }
        }

        Ok(())
    }

    /// Looks up a model feature by name.
    pub fn feature(&self, name: &str) -> Option<&FeatureConfig> {
        self.model.features.get(name)
    }

    /// Model features assigned to `tower`, in name order.
    pub fn features_for(&self, tower: Tower) -> impl Iterator<Item = (&str, &FeatureConfig)> {
        self.model
            .features
            .iter()
            .filter(move |(_, f)| f.belongs_to == tower)
            .map(|(name, f)| (name.as_str(), f))
    }

    /// All embedding features, in name order.
    pub fn embedding_features(&self) -> impl Iterator<Item = (&str, &EmbeddingFeature)> {
        self.model
            .features
            .iter()
            .filter_map(|(name, f)| f.embedding().map(|e| (name.as_str(), e)))
    }

    /// All dense features, in name order.
    pub fn dense_features(&self) -> impl Iterator<Item = &str> {
        self.model
            .features
            .iter()
            .filter(|(_, f)| f.is_dense())
            .map(|(name, _)| name.as_str())
    }

    /// The feature whose vocabulary `name` resolves to: the reuse target if
    /// `reuse_vocab` is set, `name` itself if it declares a `vocab_path`,
    /// `None` otherwise.
    pub fn vocab_owner<'a>(&'a self, name: &'a str) -> Option<&'a str> {
        let embedding = self.feature(name)?.embedding()?;
        if let Some(target) = &embedding.reuse_vocab {
            return Some(target.as_str());
        }
        if embedding.vocab_path.is_some() {
            return Some(name);
        }
        None
    }

    /// The feature whose embedding table `name` resolves to. Reuse is
    /// followed one level; a feature that does not reuse owns its table.
    pub fn table_owner<'a>(&'a self, name: &'a str) -> Option<&'a str> {
        let embedding = self.feature(name)?.embedding()?;
        match &embedding.reuse_embedding {
            Some(target) => Some(target.as_str()),
            None => Some(name),
        }
    }

    /// Embedding width of `name`, resolved through table reuse.
    pub fn embedding_dim_of(&self, name: &str) -> Option<usize> {
        let owner = self.table_owner(name)?;
        self.feature(owner)?.embedding()?.embedding_dim
    }

    /// Total table rows needed for `name`, resolved through table reuse.
    pub fn index_space_of(&self, name: &str) -> Option<usize> {
        let owner = self.table_owner(name)?;
        self.feature(owner)?.embedding()?.index_space()
    }

    /// Index positions `name` produces per record.
    pub fn width_of(&self, name: &str) -> Option<usize> {
        Some(self.feature(name)?.embedding()?.width())
    }

    /// The dataset column used by the warehouse shard predicate, if any.
    pub fn sampling_column(&self) -> Option<&str> {
        self.dataset_features
            .iter()
            .find(|(_, c)| c.use_for_sampling)
            .map(|(name, _)| name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_yaml() -> String {
        r#"
epochs: 2
global_batch_size: 8
drop_remainder: false
label: clicked
shuffle_buffer_size: 64
cycle_length: 2
format: csv
model:
  learning_rate: 0.05
  loss: bce
  l2_regularization: 0.0001
  user_linear_units: [16, 8]
  post_linear_units: [16, 8]
  features:
    user_id:
      type: embedding_lookup
      belongs_to: user
      hash: true
      vocab_size: 1000
      embedding_dim: 8
    user_history:
      type: embedding_lookup
      belongs_to: user
      reuse_embedding: post_id
      reuse_vocab: post_id
      split_by_space: true
      seq_len: 5
    post_id:
      type: embedding_lookup
      belongs_to: post
      vocab_path: vocabs/post_id.csv
      vocab_size: 500
      num_oov_buckets: 10
      embedding_dim: 8
    post_age_hours:
      type: dense
      belongs_to: post
dataset_features:
  user_id: { type: str, use_for_sampling: true }
  user_history: { type: str }
  post_id: { type: str, keep: true }
  post_age_hours: { type: float }
  clicked: { type: int }
"#
        .to_string()
    }

    fn parse(yaml: &str) -> Config {
        Config::from_yaml_str(yaml).expect("parse")
    }

    #[test]
    fn base_config_parses_and_validates() {
        let config = parse(&base_yaml());
        config.validate().expect("validate");
        assert_eq!(config.epochs, 2);
        assert_eq!(config.cycle_length, 2);
        assert_eq!(config.model.features.len(), 4);
        assert_eq!(config.sampling_column(), Some("user_id"));
    }

    #[test]
    fn tagged_feature_kinds_round_trip() {
        let config = parse(&base_yaml());
        assert!(config.feature("post_age_hours").unwrap().is_dense());
        let user_id = config.feature("user_id").unwrap().embedding().unwrap();
        assert!(user_id.hash);
        assert_eq!(user_id.combine_mode, CombineMode::Sum);

        let text = serde_yaml::to_string(&config).unwrap();
        let back = parse(&text);
        assert_eq!(back, config);
    }

    #[test]
    fn reuse_resolution() {
        let config = parse(&base_yaml());
        assert_eq!(config.table_owner("user_history"), Some("post_id"));
        assert_eq!(config.table_owner("post_id"), Some("post_id"));
        assert_eq!(config.vocab_owner("user_history"), Some("post_id"));
        assert_eq!(config.vocab_owner("user_id"), None);
        assert_eq!(config.embedding_dim_of("user_history"), Some(8));
        // Vocabulary rows plus out-of-vocabulary buckets.
        assert_eq!(config.index_space_of("post_id"), Some(510));
        // Hash features map straight into the vocabulary range.
        assert_eq!(config.index_space_of("user_id"), Some(1000));
        assert_eq!(config.width_of("user_history"), Some(5));
        assert_eq!(config.width_of("post_id"), Some(1));
    }

    #[test]
    fn hash_requires_vocab_size() {
        let yaml = base_yaml().replace("      vocab_size: 1000\n", "");
        let err = parse(&yaml).validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingField {
                field: "hash",
                requires: "vocab_size",
                ..
            }
        ));
    }

    #[test]
    fn vocab_path_requires_oov_buckets() {
        let yaml = base_yaml().replace("      num_oov_buckets: 10\n", "");
        let err = parse(&yaml).validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingField {
                field: "vocab_path",
                requires: "num_oov_buckets",
                ..
            }
        ));
    }

    #[test]
    fn split_requires_seq_len() {
        let yaml = base_yaml().replace("      seq_len: 5\n", "");
        let err = parse(&yaml).validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingField {
                field: "split_by_space",
                requires: "seq_len",
                ..
            }
        ));
    }

    #[test]
    fn embedding_feature_requires_dim_unless_reused() {
        let yaml = base_yaml().replace("      vocab_size: 1000\n      embedding_dim: 8\n", "");
        // Dropping both also drops the hash prerequisite, so clear hash too.
        let yaml = yaml.replace("      hash: true\n", "");
        let err = parse(&yaml).validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingField {
                requires: "embedding_dim",
                ..
            }
        ));
    }

    #[test]
    fn unknown_column_rejected() {
        let yaml = base_yaml().replace("  user_id: { type: str, use_for_sampling: true }\n", "");
        let err = parse(&yaml).validate().unwrap_err();
        assert!(matches!(err, ConfigError::UnknownColumn { feature } if feature == "user_id"));
    }

    #[test]
    fn unknown_label_rejected() {
        let yaml = base_yaml().replace("label: clicked", "label: missing");
        let err = parse(&yaml).validate().unwrap_err();
        assert!(matches!(err, ConfigError::UnknownLabel { label } if label == "missing"));
    }

    #[test]
    fn unknown_reuse_target_rejected() {
        let yaml = base_yaml().replace("reuse_embedding: post_id", "reuse_embedding: nope");
        let err = parse(&yaml).validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::UnknownReference {
                field: "reuse_embedding",
                ..
            }
        ));
    }

    #[test]
    fn reuse_of_reusing_feature_rejected() {
        let yaml = base_yaml().replace(
            "    post_id:\n      type: embedding_lookup\n      belongs_to: post\n",
            "    post_id:\n      type: embedding_lookup\n      belongs_to: post\n      reuse_embedding: user_id\n",
        );
        let err = parse(&yaml).validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidReuse { .. }));
    }

    #[test]
    fn zero_batch_size_rejected() {
        let yaml = base_yaml().replace("global_batch_size: 8", "global_batch_size: 0");
        let err = parse(&yaml).validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::NonPositive {
                field: "global_batch_size"
            }
        ));
    }

    #[test]
    fn empty_tower_rejected() {
        let yaml = base_yaml().replace("      belongs_to: post\n", "      belongs_to: user\n");
        let err = parse(&yaml).validate().unwrap_err();
        assert!(matches!(err, ConfigError::EmptyTower { tower } if tower == "post"));
    }

    #[test]
    fn warehouse_format_requires_sampling_column() {
        let yaml = base_yaml()
            .replace("format: csv", "format: warehouse_table")
            .replace(
                "  user_id: { type: str, use_for_sampling: true }",
                "  user_id: { type: str }",
            );
        let err = parse(&yaml).validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn two_sampling_columns_rejected() {
        let yaml = base_yaml().replace(
            "  post_id: { type: str, keep: true }",
            "  post_id: { type: str, keep: true, use_for_sampling: true }",
        );
        let err = parse(&yaml).validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn dropout_out_of_range_rejected() {
        let yaml = base_yaml().replace("  loss: bce", "  loss: bce\n  dropout: 1.5");
        let err = parse(&yaml).validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn features_for_orders_by_name() {
        let config = parse(&base_yaml());
        let user: Vec<&str> = config.features_for(Tower::User).map(|(n, _)| n).collect();
        assert_eq!(user, vec!["user_history", "user_id"]);
        let post: Vec<&str> = config.features_for(Tower::Post).map(|(n, _)| n).collect();
        assert_eq!(post, vec!["post_age_hours", "post_id"]);
    }

    #[test]
    fn warehouse_format_with_sampling_column_validates() {
        let yaml = base_yaml().replace("format: csv", "format: warehouse_table");
        parse(&yaml).validate().expect("validate");
    }

    #[test]
    fn missing_required_top_level_field_fails_parse() {
        let yaml = base_yaml().replace("label: clicked\n", "");
        assert!(Config::from_yaml_str(&yaml).is_err());
    }
}
