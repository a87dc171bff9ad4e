//! One-shot construction of a ready-to-run engine.
//!
//! [`EngineContext::build`] turns a configuration document into every
//! collaborator a training or serving process needs, in dependency
//! order: validation first, then vocabularies, then the record
//! transformer, then the scorer with its embedding store. A
//! configuration error aborts the build before any data file is
//! opened.

use crate::error::Result;
use crate::scorer::TwoTowerScorer;
use recall_core::Config;
use recall_data::{
    RecordReader, RecordTransformer, ShardedBatchSource, TableSource, TransformPipeline,
    VocabularyStore,
};
use std::sync::Arc;
use tracing::info;

/// An engine instance: the validated configuration plus the shared
/// vocabulary store, the record transformer, and the scorer built
/// from it.
pub struct EngineContext {
    config: Config,
    vocabularies: Arc<VocabularyStore>,
    transformer: Arc<RecordTransformer>,
    scorer: TwoTowerScorer,
}

impl EngineContext {
    /// Validates `config` and builds the full collaborator set.
    pub fn build(config: Config) -> Result<Self> {
        config.validate()?;
        let vocabularies = Arc::new(VocabularyStore::load(&config)?);
        let transformer = Arc::new(RecordTransformer::new(&config, &vocabularies)?);
        let scorer = TwoTowerScorer::new(&config)?;
        info!(
            features = config.model.features.len(),
            tables = scorer.embedding_store().num_tables(),
            "engine context ready"
        );
        Ok(Self {
            config,
            vocabularies,
            transformer,
            scorer,
        })
    }

    /// The validated configuration the context was built from.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The loaded vocabularies, shared with every pipeline.
    pub fn vocabularies(&self) -> &VocabularyStore {
        &self.vocabularies
    }

    /// The record transformer handle, for custom pipeline wiring.
    pub fn transformer(&self) -> &Arc<RecordTransformer> {
        &self.transformer
    }

    /// The scorer.
    pub fn scorer(&self) -> &TwoTowerScorer {
        &self.scorer
    }

    /// Mutable scorer access, the parameter-update path between steps.
    pub fn scorer_mut(&mut self) -> &mut TwoTowerScorer {
        &mut self.scorer
    }

    /// Starts the staged pipeline over this worker's shard of the files
    /// matching `pattern`.
    pub fn file_pipeline(
        &self,
        reader: Arc<dyn RecordReader>,
        pattern: &str,
        shard_index: usize,
        num_shards: usize,
    ) -> Result<TransformPipeline> {
        let source =
            ShardedBatchSource::from_files(&self.config, reader, pattern, shard_index, num_shards)?;
        Ok(TransformPipeline::new(
            &source,
            Arc::clone(&self.transformer),
        ))
    }

    /// Starts the staged pipeline over this worker's shard of a
    /// warehouse table.
    pub fn table_pipeline(
        &self,
        table: Arc<dyn TableSource>,
        shard_index: usize,
        num_shards: usize,
    ) -> Result<TransformPipeline> {
        let source = ShardedBatchSource::from_table(&self.config, table, shard_index, num_shards)?;
        Ok(TransformPipeline::new(
            &source,
            Arc::clone(&self.transformer),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ModelError;
    use recall_data::{CsvReader, FeatureBatch, Record};
    use std::fs;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_vocab(dir: &TempDir, name: &str, rows: &[(&str, i64)]) -> String {
        let path = dir.path().join(name);
        let mut file = fs::File::create(&path).unwrap();
        for (token, index) in rows {
            writeln!(file, "{},{}", token, index).unwrap();
        }
        path.display().to_string()
    }

    fn vocab_config(vocab_path: &str) -> Config {
        let yaml = format!(
            r#"
epochs: 1
global_batch_size: 2
label: clicked
format: csv
model:
  loss: mse
  features:
    uid:
      type: embedding_lookup
      belongs_to: user
      hash: true
      vocab_size: 8
      embedding_dim: 4
    age:
      type: dense
      belongs_to: user
    pid:
      type: embedding_lookup
      belongs_to: post
      vocab_path: "{vocab_path}"
      vocab_size: 3
      num_oov_buckets: 2
      embedding_dim: 5
dataset_features:
  uid: {{ type: str }}
  age: {{ type: float }}
  pid: {{ type: str }}
  clicked: {{ type: int }}
"#
        );
        Config::from_yaml_str(&yaml).unwrap()
    }

    #[test]
    fn build_wires_transformer_and_scorer_together() {
        let dir = TempDir::new().unwrap();
        let vocab = write_vocab(&dir, "pid.csv", &[("p1", 0), ("p2", 1), ("p3", 2)]);
        let context = EngineContext::build(vocab_config(&vocab)).unwrap();

        let record = Record::new()
            .with("uid", "u-1")
            .with("age", 30.5f64)
            .with("pid", "p2")
            .with("clicked", 1i64);
        let transformed = context.transformer().transform(&record).unwrap();
        let batch = FeatureBatch::from_records(vec![transformed]).unwrap();

        let scores = context.scorer().score(&batch).unwrap();
        assert_eq!(scores.shape(), &[1]);

        // No MLPs, so the tower widths are the raw input widths:
        // 4 + 1 dense on the user side, 5 on the post side.
        assert_eq!(context.scorer().output_dim(), 5);
        assert!(context.vocabularies().table("pid").is_some());
    }

    #[test]
    fn config_errors_abort_before_any_file_is_read() {
        // The vocabulary path does not exist; the bad label must fail
        // the build first.
        let mut config = vocab_config("/nonexistent/pid.csv");
        config.label = "nope".to_string();
        match EngineContext::build(config) {
            Err(ModelError::Config(_)) => {}
            other => panic!("expected a config error, got {:?}", other.err()),
        }
    }

    #[test]
    fn vocabulary_row_mismatch_is_fatal_at_load() {
        let dir = TempDir::new().unwrap();
        // Two rows for a declared vocab_size of 3.
        let vocab = write_vocab(&dir, "pid.csv", &[("p1", 0), ("p2", 1)]);
        match EngineContext::build(vocab_config(&vocab)) {
            Err(ModelError::Vocab(_)) => {}
            other => panic!("expected a vocabulary error, got {:?}", other.err()),
        }
    }

    #[test]
    fn file_pipeline_batches_a_csv_shard() {
        let dir = TempDir::new().unwrap();
        let csv_path = dir.path().join("events-00.csv");
        let mut file = fs::File::create(&csv_path).unwrap();
        writeln!(file, "uid,pid,clicked").unwrap();
        for i in 0..4 {
            writeln!(file, "u-{i},p-{i},{}", i % 2).unwrap();
        }

        let yaml = r#"
epochs: 1
global_batch_size: 2
label: clicked
format: csv
model:
  loss: mse
  features:
    uid:
      type: embedding_lookup
      belongs_to: user
      hash: true
      vocab_size: 16
      embedding_dim: 3
    pid:
      type: embedding_lookup
      belongs_to: post
      hash: true
      vocab_size: 16
      embedding_dim: 3
dataset_features:
  uid: { type: str }
  pid: { type: str }
  clicked: { type: int }
"#;
        let context = EngineContext::build(Config::from_yaml_str(yaml).unwrap()).unwrap();

        let reader = Arc::new(CsvReader::new(context.config()));
        let pattern = format!("{}/*.csv", dir.path().display());
        let batches: Vec<FeatureBatch> = context
            .file_pipeline(reader, &pattern, 0, 1)
            .unwrap()
            .collect::<std::result::Result<_, _>>()
            .unwrap();

        assert_eq!(batches.len(), 2);
        assert!(batches.iter().all(|b| b.batch_size() == 2));
        for batch in &batches {
            let scores = context.scorer().score(batch).unwrap();
            assert_eq!(scores.shape(), &[2]);
        }
    }
}
