//! Vocabulary tables mapping tokens to embedding indices.
//!
//! A vocabulary file is a two-column `token,index` CSV, optionally
//! gzip-compressed (detected by a `.gz` suffix). Loading is strict: the
//! file must hold exactly the declared number of rows, every index must
//! parse, and duplicate tokens are rejected. Unknown tokens at lookup
//! time land deterministically in one of the out-of-vocabulary buckets
//! appended past the vocabulary range.

use flate2::read::GzDecoder;
use recall_core::config::Config;
use recall_core::fingerprint::fingerprint64;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Errors raised while loading or resolving vocabularies.
#[derive(Error, Debug)]
pub enum VocabError {
    /// The vocabulary file could not be read.
    #[error("failed to read vocabulary {path}: {source}")]
    Io {
        /// Path of the vocabulary file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A line did not have the `token,index` shape.
    #[error("vocabulary {path} line {line}: {message}")]
    Malformed {
        /// Path of the vocabulary file.
        path: PathBuf,
        /// One-based line number.
        line: usize,
        /// What was wrong with the line.
        message: String,
    },

    /// The file did not hold exactly the declared number of rows.
    #[error("vocabulary {path} has {actual} rows, expected exactly {expected}")]
    RowCount {
        /// Path of the vocabulary file.
        path: PathBuf,
        /// Declared `vocab_size`.
        expected: usize,
        /// Rows actually present.
        actual: usize,
    },

    /// The same token appeared twice.
    #[error("vocabulary {path} line {line}: duplicate token '{token}'")]
    Duplicate {
        /// Path of the vocabulary file.
        path: PathBuf,
        /// One-based line number of the second occurrence.
        line: usize,
        /// The duplicated token.
        token: String,
    },

    /// A feature declared a vocabulary the configuration does not resolve.
    #[error("feature '{feature}' has no vocabulary to load")]
    Unresolved {
        /// The offending feature name.
        feature: String,
    },
}

/// Result alias for vocabulary operations.
pub type Result<T> = std::result::Result<T, VocabError>;

/// An immutable token-to-index table with out-of-vocabulary bucketing.
///
/// # Example
///
/// ```
/// use recall_data::vocab::VocabularyTable;
///
/// let table = VocabularyTable::from_entries(
///     vec![("cats".into(), 0), ("dogs".into(), 1)],
///     4,
/// );
/// assert_eq!(table.lookup("cats"), 0);
/// let oov = table.lookup("ferrets");
/// assert!((2..6).contains(&oov));
/// assert_eq!(oov, table.lookup("ferrets"));
/// ```
#[derive(Debug, Clone)]
pub struct VocabularyTable {
    tokens: HashMap<String, i64>,
    vocab_size: usize,
    num_oov_buckets: usize,
}

impl VocabularyTable {
    /// Loads a table from a `token,index` CSV file, transparently
    /// decompressing `.gz` files. The file must hold exactly
    /// `vocab_size` rows.
    pub fn load(path: &Path, vocab_size: usize, num_oov_buckets: usize) -> Result<Self> {
        let file = File::open(path).map_err(|source| VocabError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let reader: Box<dyn Read> = if path.extension().is_some_and(|e| e == "gz") {
            Box::new(GzDecoder::new(file))
        } else {
            Box::new(file)
        };

        let mut tokens = HashMap::with_capacity(vocab_size);
        for (idx, line) in BufReader::new(reader).lines().enumerate() {
            let line_no = idx + 1;
            let line = line.map_err(|source| VocabError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            if line.is_empty() {
                continue;
            }
            let (token, index) = line.split_once(',').ok_or_else(|| VocabError::Malformed {
                path: path.to_path_buf(),
                line: line_no,
                message: "expected 'token,index'".to_string(),
            })?;
            let index: i64 = index.trim().parse().map_err(|_| VocabError::Malformed {
                path: path.to_path_buf(),
                line: line_no,
                message: format!("index '{}' is not an integer", index),
            })?;
            if tokens.insert(token.to_string(), index).is_some() {
                return Err(VocabError::Duplicate {
                    path: path.to_path_buf(),
                    line: line_no,
                    token: token.to_string(),
                });
            }
        }

        if tokens.len() != vocab_size {
            return Err(VocabError::RowCount {
                path: path.to_path_buf(),
                expected: vocab_size,
                actual: tokens.len(),
            });
        }

        info!(
            path = %path.display(),
            rows = vocab_size,
            oov_buckets = num_oov_buckets,
            "loaded vocabulary"
        );
        Ok(Self {
            tokens,
            vocab_size,
            num_oov_buckets,
        })
    }

    /// Builds a table from in-memory entries. `vocab_size` is the number
    /// of entries.
    pub fn from_entries(entries: Vec<(String, i64)>, num_oov_buckets: usize) -> Self {
        let vocab_size = entries.len();
        Self {
            tokens: entries.into_iter().collect(),
            vocab_size,
            num_oov_buckets,
        }
    }

    /// Maps a token to its index. Unknown tokens resolve to
    /// `vocab_size + (fingerprint64(token) % num_oov_buckets)`,
    /// identically on every run and platform.
    pub fn lookup(&self, token: &str) -> i64 {
        match self.tokens.get(token) {
            Some(&index) => index,
            None => {
                let bucket = fingerprint64(token.as_bytes()) % self.num_oov_buckets.max(1) as u64;
                self.vocab_size as i64 + bucket as i64
            }
        }
    }

    /// Number of in-vocabulary rows.
    #[inline]
    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// Number of out-of-vocabulary buckets.
    #[inline]
    pub fn num_oov_buckets(&self) -> usize {
        self.num_oov_buckets
    }

    /// Total index range: vocabulary rows plus out-of-vocabulary buckets.
    /// Embedding tables over this vocabulary need this many rows.
    #[inline]
    pub fn index_space(&self) -> usize {
        self.vocab_size + self.num_oov_buckets
    }
}

/// All vocabularies of a configuration, loaded once and shared.
///
/// Each distinct `vocab_path` is read a single time; features with
/// `reuse_vocab` resolve to the owning feature's table. The shared
/// [`Arc`] makes reuse an identity, not a copy.
#[derive(Debug, Clone, Default)]
pub struct VocabularyStore {
    by_feature: HashMap<String, Arc<VocabularyTable>>,
}

impl VocabularyStore {
    /// An empty store, for configurations without vocabulary features.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Loads every vocabulary the configuration names. The configuration
    /// must already be validated.
    pub fn load(config: &Config) -> Result<Self> {
        let mut owners: HashMap<String, Arc<VocabularyTable>> = HashMap::new();

        for (name, embedding) in config.embedding_features() {
            if embedding.reuse_vocab.is_some() {
                continue;
            }
            let path = match &embedding.vocab_path {
                Some(path) => path,
                None => continue,
            };
            let vocab_size = embedding.vocab_size.ok_or_else(|| VocabError::Unresolved {
                feature: name.to_string(),
            })?;
            let num_oov_buckets =
                embedding
                    .num_oov_buckets
                    .ok_or_else(|| VocabError::Unresolved {
                        feature: name.to_string(),
                    })?;
            let table = VocabularyTable::load(path, vocab_size, num_oov_buckets)?;
            owners.insert(name.to_string(), Arc::new(table));
        }

        let mut by_feature = HashMap::new();
        for (name, _) in config.embedding_features() {
            if let Some(owner) = config.vocab_owner(name) {
                let table = owners.get(owner).ok_or_else(|| VocabError::Unresolved {
                    feature: name.to_string(),
                })?;
                by_feature.insert(name.to_string(), Arc::clone(table));
            }
        }

        Ok(Self { by_feature })
    }

    /// The table a feature resolves to, if it has one.
    pub fn table(&self, feature: &str) -> Option<&Arc<VocabularyTable>> {
        self.by_feature.get(feature)
    }

    /// Number of features with a resolved vocabulary.
    pub fn len(&self) -> usize {
        self.by_feature.len()
    }

    /// Whether no feature has a vocabulary.
    pub fn is_empty(&self) -> bool {
        self.by_feature.is_empty()
    }

    /// Inserts a table under a feature name. Intended for tests and
    /// programmatic setups that bypass file loading.
    pub fn insert(&mut self, feature: impl Into<String>, table: Arc<VocabularyTable>) {
        self.by_feature.insert(feature.into(), table);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use std::io::Write;

    fn write_vocab(dir: &Path, name: &str, rows: &[(&str, i64)]) -> PathBuf {
        let path = dir.join(name);
        let mut contents = String::new();
        for (token, index) in rows {
            contents.push_str(&format!("{},{}\n", token, index));
        }
        if name.ends_with(".gz") {
            let file = File::create(&path).unwrap();
            let mut enc = GzEncoder::new(file, flate2::Compression::default());
            enc.write_all(contents.as_bytes()).unwrap();
            enc.finish().unwrap();
        } else {
            std::fs::write(&path, contents).unwrap();
        }
        path
    }

    #[test]
    fn loads_plain_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_vocab(dir.path(), "v.csv", &[("10", 0), ("20", 1), ("30", 2)]);
        let table = VocabularyTable::load(&path, 3, 5).unwrap();
        assert_eq!(table.lookup("10"), 0);
        assert_eq!(table.lookup("30"), 2);
        assert_eq!(table.index_space(), 8);
    }

    #[test]
    fn loads_gzip_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_vocab(dir.path(), "v.csv.gz", &[("a", 0), ("b", 1)]);
        let table = VocabularyTable::load(&path, 2, 1).unwrap();
        assert_eq!(table.lookup("b"), 1);
    }

    #[test]
    fn row_count_mismatch_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_vocab(dir.path(), "v.csv", &[("a", 0), ("b", 1)]);
        let err = VocabularyTable::load(&path, 3, 1).unwrap_err();
        assert!(matches!(
            err,
            VocabError::RowCount {
                expected: 3,
                actual: 2,
                ..
            }
        ));
    }

    #[test]
    fn malformed_line_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v.csv");
        std::fs::write(&path, "a,0\nno-comma-here\n").unwrap();
        let err = VocabularyTable::load(&path, 2, 1).unwrap_err();
        assert!(matches!(err, VocabError::Malformed { line: 2, .. }));
    }

    #[test]
    fn duplicate_token_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_vocab(dir.path(), "v.csv", &[("a", 0), ("a", 1)]);
        let err = VocabularyTable::load(&path, 2, 1).unwrap_err();
        assert!(matches!(err, VocabError::Duplicate { .. }));
    }

    #[test]
    fn oov_lands_past_vocab_range_and_is_stable() {
        let table =
            VocabularyTable::from_entries(vec![("x".into(), 0), ("y".into(), 1)], 8);
        for token in ["unknown", "another", "третий"] {
            let index = table.lookup(token);
            assert!(
                (2..10).contains(&index),
                "oov index {} for '{}' out of range",
                index,
                token
            );
            assert_eq!(index, table.lookup(token));
        }
    }

    #[test]
    fn store_shares_reused_tables() {
        let yaml = r#"
epochs: 1
global_batch_size: 2
label: label
format: csv
model:
  features:
    post_id:
      type: embedding_lookup
      belongs_to: post
      vocab_path: VOCAB
      vocab_size: 2
      num_oov_buckets: 3
      embedding_dim: 4
    seen_posts:
      type: embedding_lookup
      belongs_to: user
      reuse_vocab: post_id
      reuse_embedding: post_id
      split_by_space: true
      seq_len: 3
dataset_features:
  post_id: { type: str }
  seen_posts: { type: str }
  label: { type: int }
"#;
        let dir = tempfile::tempdir().unwrap();
        let path = write_vocab(dir.path(), "post_id.csv", &[("p1", 0), ("p2", 1)]);
        let yaml = yaml.replace("VOCAB", &path.display().to_string());
        let config = Config::from_yaml_str(&yaml).unwrap();
        config.validate().unwrap();

        let store = VocabularyStore::load(&config).unwrap();
        let owner = store.table("post_id").unwrap();
        let reuser = store.table("seen_posts").unwrap();
        assert!(Arc::ptr_eq(owner, reuser));
        assert!(store.table("label").is_none());
    }
}
