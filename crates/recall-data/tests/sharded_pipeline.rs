use recall_core::Config;
use recall_data::{
    CsvReader, FeatureBatch, FeatureValue, FieldValue, PipelineOptions, RecordReader,
    RecordTransformer, ShardedBatchSource, TransformPipeline, VocabularyStore,
};
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

fn config_yaml(dir: &Path, extra: &str) -> String {
    format!(
        r#"
epochs: 1
global_batch_size: 4
label: clicked
format: csv
cycle_length: 2
{extra}
model:
  features:
    user_id:
      type: embedding_lookup
      belongs_to: user
      hash: true
      vocab_size: 128
      embedding_dim: 8
    history:
      type: embedding_lookup
      belongs_to: user
      reuse_vocab: post_id
      reuse_embedding: post_id
      split_by_space: true
      seq_len: 3
    post_id:
      type: embedding_lookup
      belongs_to: post
      vocab_path: '{vocab}'
      vocab_size: 4
      num_oov_buckets: 2
      embedding_dim: 8
dataset_features:
  user_id: {{ type: str, keep: true }}
  history: {{ type: str }}
  post_id: {{ type: str }}
  clicked: {{ type: int }}
"#,
        vocab = dir.join("posts.vocab").display(),
    )
}

fn setup(dir: &Path, extra: &str) -> (Config, Arc<RecordTransformer>) {
    std::fs::write(dir.join("posts.vocab"), "p0,0\np1,1\np2,2\np3,3\n").expect("write vocab");
    let config = Config::from_yaml_str(&config_yaml(dir, extra)).expect("parse config");
    config.validate().expect("validate config");
    let store = VocabularyStore::load(&config).expect("load vocabularies");
    let transformer = Arc::new(RecordTransformer::new(&config, &store).expect("build transformer"));
    (config, transformer)
}

fn write_part(dir: &Path, name: &str, rows: &[String]) {
    let mut out = String::from("user_id,history,post_id,clicked\n");
    for row in rows {
        out.push_str(row);
        out.push('\n');
    }
    std::fs::write(dir.join(name), out).expect("write csv");
}

fn shard_source(
    config: &Config,
    dir: &Path,
    pattern: &str,
    shard_index: usize,
    num_shards: usize,
) -> ShardedBatchSource {
    let reader: Arc<dyn RecordReader> = Arc::new(CsvReader::new(config));
    let pattern = dir.join(pattern);
    ShardedBatchSource::from_files(
        config,
        reader,
        pattern.to_str().expect("utf8 path"),
        shard_index,
        num_shards,
    )
    .expect("build source")
}

fn drain(source: &ShardedBatchSource, transformer: &Arc<RecordTransformer>) -> Vec<FeatureBatch> {
    let pipeline = TransformPipeline::with_options(
        source,
        Arc::clone(transformer),
        PipelineOptions {
            workers: 3,
            queue_capacity: 8,
        },
    );
    pipeline
        .collect::<Result<Vec<_>, _>>()
        .expect("drain pipeline")
}

fn kept_users(batches: &[FeatureBatch]) -> Vec<String> {
    batches
        .iter()
        .flat_map(|batch| batch.kept("user_id").expect("kept column").to_vec())
        .map(|value| match value {
            FieldValue::Str(user) => user,
            other => panic!("unexpected kept value: {other:?}"),
        })
        .collect()
}

#[test]
fn two_shards_cover_all_records_exactly_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    for part in 0..4 {
        let rows: Vec<String> = (0..5)
            .map(|i| format!("u{part}-{i},p1 p2,p0,{i}"))
            .collect();
        write_part(dir.path(), &format!("part-{part}.csv"), &rows);
    }
    let (config, transformer) = setup(dir.path(), "");

    let mut counts: HashMap<String, usize> = HashMap::new();
    for shard in 0..2 {
        let source = shard_source(&config, dir.path(), "part-*.csv", shard, 2);
        let batches = drain(&source, &transformer);
        for user in kept_users(&batches) {
            *counts.entry(user).or_default() += 1;
        }
    }

    assert_eq!(counts.len(), 20, "every record seen");
    assert!(
        counts.values().all(|&n| n == 1),
        "no record duplicated across shards"
    );
}

#[test]
fn shuffled_pipeline_is_deterministic_across_runs() {
    let dir = tempfile::tempdir().expect("tempdir");
    for part in 0..3 {
        let rows: Vec<String> = (0..7)
            .map(|i| format!("u{part}-{i},p1,p2,{i}"))
            .collect();
        write_part(dir.path(), &format!("part-{part}.csv"), &rows);
    }
    let (config, transformer) = setup(dir.path(), "shuffle_buffer_size: 8");

    let run = || {
        let source = shard_source(&config, dir.path(), "part-*.csv", 0, 1);
        kept_users(&drain(&source, &transformer))
    };
    let first = run();
    let second = run();
    assert_eq!(first.len(), 21);
    assert_eq!(first, second);
}

#[test]
fn vocabulary_and_reuse_flow_through_the_pipeline() {
    let dir = tempfile::tempdir().expect("tempdir");
    // One record whose history holds the same token as post_id, plus an
    // unknown history token that must land in an oov bucket.
    write_part(
        dir.path(),
        "part-0.csv",
        &["u0,p3 mystery,p3,1".to_string()],
    );
    let (config, transformer) = setup(dir.path(), "");

    let source = shard_source(&config, dir.path(), "part-*.csv", 0, 1);
    let batches = drain(&source, &transformer);
    assert_eq!(batches.len(), 1);
    let batch = &batches[0];

    let post = batch.indices("post_id").expect("post_id indices");
    assert_eq!(post.row(0), &[3]);

    // history reuses post_id's vocabulary: same token, same index; the
    // unknown token and the pad sentinel stay inside the oov range.
    let history = batch.indices("history").expect("history indices");
    let row = history.row(0);
    assert_eq!(row.len(), 3);
    assert_eq!(row[0], 3);
    assert!((4..6).contains(&row[1]));
    assert!((4..6).contains(&row[2]));

    let user = batch.indices("user_id").expect("user_id indices");
    assert!((0..128).contains(&user.row(0)[0]));
    assert_eq!(batch.labels(), &[1.0]);
}

#[test]
fn gzip_sources_mark_every_epoch() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut encoder = flate2::write::GzEncoder::new(
        std::fs::File::create(dir.path().join("part-0.csv.gz")).expect("create gz"),
        flate2::Compression::default(),
    );
    encoder
        .write_all(b"user_id,history,post_id,clicked\nu0,p1,p0,0\nu1,p2,p1,1\nu2,p3,p2,0\n")
        .expect("write gz");
    encoder.finish().expect("finish gz");

    let (mut config, transformer) = setup(dir.path(), "compression: gzip");
    config.epochs = 2;

    let source = shard_source(&config, dir.path(), "part-*.csv.gz", 0, 1);
    let sizes: Vec<usize> = drain(&source, &transformer)
        .iter()
        .map(|batch| batch.batch_size())
        .collect();
    // 3 records per pass, batch size 4: each pass flushes its remainder.
    assert_eq!(sizes, vec![3, 3]);
}

#[test]
fn transform_matches_batch_transform() {
    let dir = tempfile::tempdir().expect("tempdir");
    let rows: Vec<String> = (0..6)
        .map(|i| format!("u{i},p0 p{i},p1,{i}"))
        .collect();
    write_part(dir.path(), "part-0.csv", &rows);
    let (config, transformer) = setup(dir.path(), "");

    let source = shard_source(&config, dir.path(), "part-*.csv", 0, 1);
    let raw: Vec<_> = source
        .batches()
        .collect::<Result<Vec<_>, _>>()
        .expect("raw batches");

    for batch in raw {
        let together = transformer.transform_batch(&batch).expect("batch transform");
        for (record, transformed) in batch.iter().zip(&together) {
            let single = transformer.transform(record).expect("single transform");
            assert_eq!(single.label, transformed.label);
            for (name, value) in &single.features {
                match (value, transformed.features.get(name).expect("feature")) {
                    (FeatureValue::Indices(a), FeatureValue::Indices(b)) => assert_eq!(a, b),
                    (FeatureValue::Dense(a), FeatureValue::Dense(b)) => assert_eq!(a, b),
                    other => panic!("feature kind changed: {other:?}"),
                }
            }
        }
    }
}
