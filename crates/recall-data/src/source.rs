//! Sharded record sources over file globs and warehouse tables.
//!
//! [`ShardedBatchSource`] turns a source locator plus a worker-sharding
//! context (`shard_index` of `num_shards`) into a deterministic record
//! stream. File sources shard at file granularity after a seeded shuffle
//! of the sorted glob expansion; warehouse tables shard row-wise with a
//! [`ShardPredicate`] over the designated sampling column. Raw decoding
//! stays behind the [`RecordReader`] and [`TableSource`] traits so the
//! engine never touches storage formats directly.
//!
//! The two source kinds repeat differently. File streams batch first and
//! repeat after, so every epoch flushes (or drops) its own remainder;
//! table streams repeat first and batch after, so batches may span epoch
//! boundaries and only the end of the stream can leave a remainder.

use crate::interleave::Interleave;
use crate::record::Record;
use crate::transform::TransformError;
use flate2::read::GzDecoder;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use recall_core::config::{ColumnType, Compression, Config, SourceFormat};
use recall_core::fingerprint::fingerprint64;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Seed for the deterministic shuffle of the sorted file list.
pub const FILE_SHUFFLE_SEED: u64 = 42;

/// Errors raised while producing records.
#[derive(Error, Debug)]
pub enum SourceError {
    /// An underlying file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// The file being read.
        path: PathBuf,
        /// The underlying error.
        source: std::io::Error,
    },

    /// The source glob pattern is malformed.
    #[error("bad file pattern '{pattern}': {source}")]
    Pattern {
        /// The offending pattern.
        pattern: String,
        /// The underlying error.
        source: glob::PatternError,
    },

    /// A directory could not be walked during glob expansion.
    #[error(transparent)]
    Walk(#[from] glob::GlobError),

    /// A file pattern matched nothing.
    #[error("pattern '{pattern}' matched no files")]
    NoFiles {
        /// The offending pattern.
        pattern: String,
    },

    /// The sharding context is inconsistent.
    #[error("shard {shard_index} of {num_shards} is out of range")]
    InvalidShard {
        /// The requested shard.
        shard_index: usize,
        /// The shard count.
        num_shards: usize,
    },

    /// A file source was requested for a table format.
    #[error("source format {format:?} is not file based")]
    NotFileBased {
        /// The configured format.
        format: SourceFormat,
    },

    /// A table source was requested for a file format.
    #[error("source format {format:?} is not a warehouse table")]
    NotTable {
        /// The configured format.
        format: SourceFormat,
    },

    /// The table configuration has no `use_for_sampling` column.
    #[error("warehouse sharding needs a column marked use_for_sampling")]
    MissingSamplingColumn,

    /// A row is missing the shard column.
    #[error("record has no value for shard column '{column}'")]
    MissingShardColumn {
        /// The sampling column.
        column: String,
    },

    /// A delimited text row could not be decoded.
    #[error("{path}:{line}: {message}")]
    Csv {
        /// The file being decoded.
        path: PathBuf,
        /// One-based line number.
        line: usize,
        /// What went wrong.
        message: String,
    },

    /// Transformation of a record failed downstream of the source.
    #[error(transparent)]
    Transform(#[from] TransformError),

    /// A pipeline worker thread panicked.
    #[error("pipeline worker panicked")]
    WorkerPanicked,
}

/// Result alias for record production.
pub type Result<T> = std::result::Result<T, SourceError>;

/// A boxed stream of decoded records.
pub type RecordIter = Box<dyn Iterator<Item = Result<Record>> + Send>;

/// Decodes records from one file. Implementations exist per storage
/// format; the engine only ever drives this trait.
pub trait RecordReader: Send + Sync {
    /// Opens one file and returns its record stream.
    fn open(&self, path: &Path) -> Result<RecordIter>;
}

/// Scans rows out of a warehouse table, optionally restricted to the
/// rows selected by a [`ShardPredicate`].
pub trait TableSource: Send + Sync {
    /// Starts one scan over the table.
    fn scan(&self, shard: Option<&ShardPredicate>) -> Result<RecordIter>;
}

/// Deterministic row-to-shard assignment for table sources.
///
/// A row belongs to the shard where
/// `(fingerprint64(value) + shard_index) % num_shards == 0`, computed
/// over the rendered sampling-column value. For a fixed shard count the
/// assignment is a partition: every row lands in exactly one shard, and
/// the same row lands in the same shard on every run.
#[derive(Debug, Clone)]
pub struct ShardPredicate {
    column: String,
    shard_index: u64,
    num_shards: u64,
}

impl ShardPredicate {
    /// Builds a predicate over `column` for one shard of `num_shards`.
    pub fn new(column: impl Into<String>, shard_index: usize, num_shards: usize) -> Result<Self> {
        if num_shards == 0 || shard_index >= num_shards {
            return Err(SourceError::InvalidShard {
                shard_index,
                num_shards,
            });
        }
        Ok(Self {
            column: column.into(),
            shard_index: shard_index as u64,
            num_shards: num_shards as u64,
        })
    }

    /// Whether `record` belongs to this shard.
    pub fn matches(&self, record: &Record) -> Result<bool> {
        let value = record
            .get(&self.column)
            .ok_or_else(|| SourceError::MissingShardColumn {
                column: self.column.clone(),
            })?;
        let hash = fingerprint64(value.render().as_bytes()) as i64;
        Ok(hash.unsigned_abs().wrapping_add(self.shard_index) % self.num_shards == 0)
    }

    /// The sampling column the predicate hashes.
    #[inline]
    pub fn column(&self) -> &str {
        &self.column
    }
}

/// Expands a glob pattern into this shard's file list.
///
/// The expansion is sorted, shuffled with [`FILE_SHUFFLE_SEED`], then
/// filtered to every `num_shards`-th file starting at `shard_index`.
/// Every worker that runs this over the same file set computes the same
/// order, so the shards are disjoint and cover all files.
pub fn list_shard_files(
    pattern: &str,
    shard_index: usize,
    num_shards: usize,
) -> Result<Vec<PathBuf>> {
    if num_shards == 0 || shard_index >= num_shards {
        return Err(SourceError::InvalidShard {
            shard_index,
            num_shards,
        });
    }
    let mut files = glob::glob(pattern)
        .map_err(|source| SourceError::Pattern {
            pattern: pattern.to_string(),
            source,
        })?
        .collect::<std::result::Result<Vec<_>, glob::GlobError>>()?;
    if files.is_empty() {
        return Err(SourceError::NoFiles {
            pattern: pattern.to_string(),
        });
    }
    files.sort();
    let mut rng = StdRng::seed_from_u64(FILE_SHUFFLE_SEED);
    files.shuffle(&mut rng);
    Ok(files
        .into_iter()
        .enumerate()
        .filter(|(index, _)| index % num_shards == shard_index)
        .map(|(_, file)| file)
        .collect())
}

/// Reads delimited text files with a header row.
///
/// Only columns declared in `dataset_features` are decoded; extra file
/// columns are ignored and declared columns absent from the header fall
/// back to their type's default (`0`, `0.0`, empty string). Files are
/// gzip-decoded when the configuration says so or the path ends in
/// `.gz`.
#[derive(Debug, Clone)]
pub struct CsvReader {
    columns: BTreeMap<String, ColumnType>,
    gzip: bool,
}

impl CsvReader {
    /// Builds a reader for the configuration's declared columns.
    pub fn new(config: &Config) -> Self {
        Self {
            columns: config
                .dataset_features
                .iter()
                .map(|(name, column)| (name.clone(), column.column_type))
                .collect(),
            gzip: config.compression == Some(Compression::Gzip),
        }
    }
}

impl RecordReader for CsvReader {
    fn open(&self, path: &Path) -> Result<RecordIter> {
        let file = File::open(path).map_err(|source| SourceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let gzip = self.gzip || path.extension().is_some_and(|ext| ext == "gz");
        let input: Box<dyn BufRead + Send> = if gzip {
            Box::new(BufReader::new(GzDecoder::new(file)))
        } else {
            Box::new(BufReader::new(file))
        };
        let mut lines = input.lines();
        let header = match lines.next() {
            None => return Ok(Box::new(std::iter::empty())),
            Some(Err(source)) => {
                return Err(SourceError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
            Some(Ok(line)) => line
                .split(',')
                .map(|name| name.trim().to_string())
                .collect::<Vec<_>>(),
        };
        Ok(Box::new(CsvRows {
            lines,
            header,
            columns: self.columns.clone(),
            path: path.to_path_buf(),
            line: 1,
        }))
    }
}

struct CsvRows {
    lines: Lines<Box<dyn BufRead + Send>>,
    header: Vec<String>,
    columns: BTreeMap<String, ColumnType>,
    path: PathBuf,
    line: usize,
}

impl CsvRows {
    fn decode(&self, line: &str) -> Result<Record> {
        let fields: Vec<&str> = line.split(',').collect();
        let mut record = Record::new();
        for (name, column_type) in &self.columns {
            record.insert(name, default_value(*column_type));
        }
        for (slot, name) in self.header.iter().enumerate() {
            let Some(column_type) = self.columns.get(name) else {
                continue;
            };
            let raw = fields.get(slot).map(|field| field.trim()).unwrap_or("");
            if raw.is_empty() {
                continue;
            }
            let value = match column_type {
                ColumnType::Str => crate::record::FieldValue::Str(raw.to_string()),
                ColumnType::Int => {
                    crate::record::FieldValue::Int(raw.parse::<i64>().map_err(|_| {
                        SourceError::Csv {
                            path: self.path.clone(),
                            line: self.line,
                            message: format!("column '{}': '{}' is not an int", name, raw),
                        }
                    })?)
                }
                ColumnType::Float => {
                    crate::record::FieldValue::Float(raw.parse::<f64>().map_err(|_| {
                        SourceError::Csv {
                            path: self.path.clone(),
                            line: self.line,
                            message: format!("column '{}': '{}' is not a float", name, raw),
                        }
                    })?)
                }
            };
            record.insert(name, value);
        }
        Ok(record)
    }
}

fn default_value(column_type: ColumnType) -> crate::record::FieldValue {
    match column_type {
        ColumnType::Str => crate::record::FieldValue::Str(String::new()),
        ColumnType::Int => crate::record::FieldValue::Int(0),
        ColumnType::Float => crate::record::FieldValue::Float(0.0),
    }
}

impl Iterator for CsvRows {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(source) => {
                    return Some(Err(SourceError::Io {
                        path: self.path.clone(),
                        source,
                    }))
                }
            };
            self.line += 1;
            if line.trim().is_empty() {
                continue;
            }
            return Some(self.decode(&line));
        }
    }
}

/// An in-memory table, mainly for tests and small fixtures.
#[derive(Debug, Clone, Default)]
pub struct MemoryTableSource {
    rows: Vec<Record>,
}

impl MemoryTableSource {
    /// Wraps a row set.
    pub fn new(rows: Vec<Record>) -> Self {
        Self { rows }
    }
}

impl TableSource for MemoryTableSource {
    fn scan(&self, shard: Option<&ShardPredicate>) -> Result<RecordIter> {
        let shard = shard.cloned();
        let rows = self.rows.clone();
        Ok(Box::new(rows.into_iter().filter_map(move |row| {
            match &shard {
                None => Some(Ok(row)),
                Some(predicate) => match predicate.matches(&row) {
                    Ok(true) => Some(Ok(row)),
                    Ok(false) => None,
                    Err(error) => Some(Err(error)),
                },
            }
        })))
    }
}

/// Buffered shuffle over a record stream using an xorshift64 generator.
/// The same seed over the same stream yields the same order.
pub struct ShuffleBuffer<I: Iterator> {
    inner: I,
    buffer: VecDeque<I::Item>,
    buffer_size: usize,
    rng_state: u64,
}

const SHUFFLE_STATE: u64 = 0x12345678_9abcdef0;

impl<I: Iterator> ShuffleBuffer<I> {
    /// Wraps `inner` with a shuffle window of `buffer_size` items.
    pub fn new(inner: I, buffer_size: usize, seed: u64) -> Self {
        Self {
            inner,
            buffer: VecDeque::with_capacity(buffer_size.max(1)),
            buffer_size: buffer_size.max(1),
            // xorshift state must never be zero
            rng_state: (SHUFFLE_STATE ^ seed).max(1),
        }
    }

    fn next_random(&mut self) -> u64 {
        let mut x = self.rng_state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.rng_state = x;
        x
    }
}

impl<I: Iterator> Iterator for ShuffleBuffer<I> {
    type Item = I::Item;

    fn next(&mut self) -> Option<Self::Item> {
        while self.buffer.len() < self.buffer_size {
            match self.inner.next() {
                Some(item) => self.buffer.push_back(item),
                None => break,
            }
        }
        if self.buffer.is_empty() {
            return None;
        }
        let idx = (self.next_random() as usize) % self.buffer.len();
        self.buffer.swap(0, idx);
        self.buffer.pop_front()
    }
}

/// One event of the unified record stream.
#[derive(Debug, Clone)]
pub enum SourceEvent {
    /// A decoded record.
    Record(Record),
    /// A pass boundary. File streams emit one per epoch; table streams
    /// emit a single one at the very end.
    EpochEnd,
}

/// Opens a file on first use so open errors surface as stream items.
struct LazyFileIter {
    path: PathBuf,
    reader: Arc<dyn RecordReader>,
    state: FileState,
}

enum FileState {
    Unopened,
    Open(RecordIter),
    Done,
}

impl LazyFileIter {
    fn new(path: PathBuf, reader: Arc<dyn RecordReader>) -> Self {
        Self {
            path,
            reader,
            state: FileState::Unopened,
        }
    }
}

impl Iterator for LazyFileIter {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match &mut self.state {
                FileState::Unopened => match self.reader.open(&self.path) {
                    Ok(stream) => self.state = FileState::Open(stream),
                    Err(error) => {
                        self.state = FileState::Done;
                        return Some(Err(error));
                    }
                },
                FileState::Open(stream) => match stream.next() {
                    Some(item) => return Some(item),
                    None => self.state = FileState::Done,
                },
                FileState::Done => return None,
            }
        }
    }
}

/// Chains `epochs` scans of one table into a single stream.
struct TableChain {
    source: Arc<dyn TableSource>,
    shard: ShardPredicate,
    remaining: usize,
    current: Option<RecordIter>,
}

impl Iterator for TableChain {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(current) = self.current.as_mut() {
                match current.next() {
                    Some(item) => return Some(item),
                    None => self.current = None,
                }
            }
            if self.remaining == 0 {
                return None;
            }
            self.remaining -= 1;
            match self.source.scan(Some(&self.shard)) {
                Ok(stream) => self.current = Some(stream),
                Err(error) => {
                    self.remaining = 0;
                    return Some(Err(error));
                }
            }
        }
    }
}

#[derive(Clone)]
enum EpochPlan {
    Files {
        files: Vec<PathBuf>,
        reader: Arc<dyn RecordReader>,
        cycle_length: usize,
        shuffle: Option<usize>,
    },
    Table {
        source: Arc<dyn TableSource>,
        shard: ShardPredicate,
        shuffle: Option<usize>,
    },
}

impl EpochPlan {
    fn build(&self, epoch: usize, epochs: usize) -> Box<dyn Iterator<Item = Result<Record>> + Send> {
        match self {
            EpochPlan::Files {
                files,
                reader,
                cycle_length,
                shuffle,
            } => {
                let streams: Vec<LazyFileIter> = files
                    .iter()
                    .map(|path| LazyFileIter::new(path.clone(), Arc::clone(reader)))
                    .collect();
                let interleaved = Interleave::new(streams, *cycle_length);
                match shuffle {
                    Some(size) => Box::new(ShuffleBuffer::new(interleaved, *size, epoch as u64)),
                    None => Box::new(interleaved),
                }
            }
            EpochPlan::Table {
                source,
                shard,
                shuffle,
            } => {
                let chain = TableChain {
                    source: Arc::clone(source),
                    shard: shard.clone(),
                    remaining: epochs,
                    current: None,
                };
                match shuffle {
                    Some(size) => Box::new(ShuffleBuffer::new(chain, *size, 0)),
                    None => Box::new(chain),
                }
            }
        }
    }
}

/// A deterministic, epoch-bounded record source for one shard.
///
/// Built from a validated [`Config`] plus the worker's sharding context.
/// [`ShardedBatchSource::events`] yields the unified record stream with
/// explicit pass boundaries; [`ShardedBatchSource::batches`] assembles
/// raw record batches honoring `drop_remainder`.
pub struct ShardedBatchSource {
    epochs: usize,
    batch_size: usize,
    drop_remainder: bool,
    plan: EpochPlan,
}

impl ShardedBatchSource {
    /// Builds a file-backed source from a glob pattern.
    pub fn from_files(
        config: &Config,
        reader: Arc<dyn RecordReader>,
        pattern: &str,
        shard_index: usize,
        num_shards: usize,
    ) -> Result<Self> {
        if !config.format.is_file_based() {
            return Err(SourceError::NotFileBased {
                format: config.format,
            });
        }
        let files = list_shard_files(pattern, shard_index, num_shards)?;
        tracing::info!(
            files = files.len(),
            shard_index,
            num_shards,
            "sharded file source ready"
        );
        Ok(Self {
            epochs: config.epochs,
            batch_size: config.global_batch_size,
            drop_remainder: config.drop_remainder,
            plan: EpochPlan::Files {
                files,
                reader,
                cycle_length: config.cycle_length,
                shuffle: config.shuffle_buffer_size,
            },
        })
    }

    /// Builds a table-backed source sharded by the sampling column.
    pub fn from_table(
        config: &Config,
        source: Arc<dyn TableSource>,
        shard_index: usize,
        num_shards: usize,
    ) -> Result<Self> {
        if config.format != SourceFormat::WarehouseTable {
            return Err(SourceError::NotTable {
                format: config.format,
            });
        }
        let column = config
            .sampling_column()
            .ok_or(SourceError::MissingSamplingColumn)?;
        let shard = ShardPredicate::new(column, shard_index, num_shards)?;
        tracing::info!(
            column = shard.column(),
            shard_index,
            num_shards,
            "sharded table source ready"
        );
        Ok(Self {
            epochs: config.epochs,
            batch_size: config.global_batch_size,
            drop_remainder: config.drop_remainder,
            plan: EpochPlan::Table {
                source,
                shard,
                shuffle: config.shuffle_buffer_size,
            },
        })
    }

    /// Records per batch.
    #[inline]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Whether short final batches are dropped.
    #[inline]
    pub fn drop_remainder(&self) -> bool {
        self.drop_remainder
    }

    /// The unified record stream with explicit pass boundaries.
    pub fn events(&self) -> Events {
        let super_epochs = match self.plan {
            EpochPlan::Files { .. } => self.epochs,
            // one chained pass; the chain repeats internally
            EpochPlan::Table { .. } => 1,
        };
        Events {
            plan: self.plan.clone(),
            epochs: self.epochs,
            super_epochs,
            built: 0,
            current: None,
            failed: false,
        }
    }

    /// Raw record batches, remainder semantics per source kind.
    pub fn batches(&self) -> RawBatches {
        RawBatches {
            events: self.events(),
            batch_size: self.batch_size,
            drop_remainder: self.drop_remainder,
            pending: Vec::new(),
            done: false,
        }
    }
}

// Manual impl: `EpochPlan` holds `Arc<dyn RecordReader>` / `Arc<dyn
// TableSource>`, which have no `Debug` bound, so the derive is unavailable.
impl fmt::Debug for ShardedBatchSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardedBatchSource")
            .field("epochs", &self.epochs)
            .field("batch_size", &self.batch_size)
            .field("drop_remainder", &self.drop_remainder)
            .finish_non_exhaustive()
    }
}

/// Iterator over [`SourceEvent`]s. Ends after the first error.
pub struct Events {
    plan: EpochPlan,
    epochs: usize,
    super_epochs: usize,
    built: usize,
    current: Option<Box<dyn Iterator<Item = Result<Record>> + Send>>,
    failed: bool,
}

impl Iterator for Events {
    type Item = Result<SourceEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(current) = self.current.as_mut() {
                match current.next() {
                    Some(Ok(record)) => return Some(Ok(SourceEvent::Record(record))),
                    Some(Err(error)) => {
                        self.failed = true;
                        return Some(Err(error));
                    }
                    None => {
                        self.current = None;
                        return Some(Ok(SourceEvent::EpochEnd));
                    }
                }
            }
            if self.built >= self.super_epochs {
                return None;
            }
            let epoch = self.built;
            self.built += 1;
            self.current = Some(self.plan.build(epoch, self.epochs));
        }
    }
}

/// Iterator of raw record batches over an event stream.
pub struct RawBatches {
    events: Events,
    batch_size: usize,
    drop_remainder: bool,
    pending: Vec<Record>,
    done: bool,
}

impl Iterator for RawBatches {
    type Item = Result<Vec<Record>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            match self.events.next() {
                Some(Ok(SourceEvent::Record(record))) => {
                    self.pending.push(record);
                    if self.pending.len() == self.batch_size {
                        return Some(Ok(std::mem::take(&mut self.pending)));
                    }
                }
                Some(Ok(SourceEvent::EpochEnd)) => {
                    if !self.pending.is_empty() {
                        if self.drop_remainder {
                            self.pending.clear();
                        } else {
                            return Some(Ok(std::mem::take(&mut self.pending)));
                        }
                    }
                }
                Some(Err(error)) => {
                    self.done = true;
                    return Some(Err(error));
                }
                None => {
                    self.done = true;
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::FieldValue;
    use std::collections::HashSet;
    use std::io::Write;

    fn file_config(yaml_extra: &str) -> Config {
        let yaml = format!(
            r#"
epochs: 1
global_batch_size: 2
label: clicked
format: csv
{yaml_extra}
model:
  features:
    user_id:
      type: embedding_lookup
      belongs_to: user
      hash: true
      vocab_size: 50
      embedding_dim: 4
    post_id:
      type: embedding_lookup
      belongs_to: post
      hash: true
      vocab_size: 50
      embedding_dim: 4
dataset_features:
  user_id: {{ type: str }}
  post_id: {{ type: str }}
  score: {{ type: float }}
  clicked: {{ type: int }}
"#
        );
        let config = Config::from_yaml_str(&yaml).unwrap();
        config.validate().unwrap();
        config
    }

    fn table_config(extra: &str) -> Config {
        let yaml = format!(
            r#"
epochs: 2
global_batch_size: 4
label: clicked
format: warehouse_table
{extra}
model:
  features:
    user_id:
      type: embedding_lookup
      belongs_to: user
      hash: true
      vocab_size: 50
      embedding_dim: 4
    post_id:
      type: embedding_lookup
      belongs_to: post
      hash: true
      vocab_size: 50
      embedding_dim: 4
dataset_features:
  user_id: {{ type: str, use_for_sampling: true }}
  post_id: {{ type: str }}
  clicked: {{ type: int }}
"#
        );
        let config = Config::from_yaml_str(&yaml).unwrap();
        config.validate().unwrap();
        config
    }

    fn write_csv(dir: &Path, name: &str, rows: &[&str]) -> PathBuf {
        let path = dir.join(name);
        let mut out = String::from("user_id,post_id,score,clicked\n");
        for row in rows {
            out.push_str(row);
            out.push('\n');
        }
        std::fs::write(&path, out).unwrap();
        path
    }

    fn table_rows(n: usize) -> Vec<Record> {
        (0..n)
            .map(|i| {
                Record::new()
                    .with("user_id", format!("user-{i}"))
                    .with("post_id", format!("post-{i}"))
                    .with("clicked", (i % 2) as i64)
            })
            .collect()
    }

    #[test]
    fn shard_files_are_disjoint_and_cover() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..7 {
            write_csv(dir.path(), &format!("part-{i}.csv"), &[]);
        }
        let pattern = dir.path().join("*.csv");
        let pattern = pattern.to_str().unwrap();

        let mut seen = HashSet::new();
        let mut total = 0;
        for shard in 0..3 {
            let files = list_shard_files(pattern, shard, 3).unwrap();
            total += files.len();
            for file in files {
                assert!(seen.insert(file), "file assigned to two shards");
            }
        }
        assert_eq!(total, 7);
        assert_eq!(seen.len(), 7);
    }

    #[test]
    fn file_order_is_stable_across_calls() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..5 {
            write_csv(dir.path(), &format!("part-{i}.csv"), &[]);
        }
        let pattern = dir.path().join("*.csv");
        let pattern = pattern.to_str().unwrap();
        let first = list_shard_files(pattern, 0, 1).unwrap();
        let second = list_shard_files(pattern, 0, 1).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 5);
    }

    #[test]
    fn empty_glob_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = dir.path().join("*.nothing");
        let err = list_shard_files(pattern.to_str().unwrap(), 0, 1).unwrap_err();
        assert!(matches!(err, SourceError::NoFiles { .. }));
    }

    #[test]
    fn out_of_range_shard_is_an_error() {
        let err = list_shard_files("*", 3, 3).unwrap_err();
        assert!(matches!(
            err,
            SourceError::InvalidShard {
                shard_index: 3,
                num_shards: 3
            }
        ));
    }

    #[test]
    fn csv_reader_decodes_declared_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(
            dir.path(),
            "part-0.csv",
            &["u1,p1,0.5,1", "u2,p2,1.5,0"],
        );
        let reader = CsvReader::new(&file_config(""));
        let records: Vec<Record> = reader
            .open(&path)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get("user_id"), Some(&FieldValue::Str("u1".into())));
        assert_eq!(records[0].get("score"), Some(&FieldValue::Float(0.5)));
        assert_eq!(records[1].get("clicked"), Some(&FieldValue::Int(0)));
    }

    #[test]
    fn csv_reader_ignores_extra_columns_and_defaults_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("odd.csv");
        // extra column, no score column, blank int field
        std::fs::write(&path, "extra,user_id,clicked,post_id\nx,u1,,p1\n").unwrap();
        let reader = CsvReader::new(&file_config(""));
        let records: Vec<Record> = reader
            .open(&path)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].get("extra").is_none());
        assert_eq!(records[0].get("score"), Some(&FieldValue::Float(0.0)));
        assert_eq!(records[0].get("clicked"), Some(&FieldValue::Int(0)));
    }

    #[test]
    fn csv_parse_error_names_file_and_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(dir.path(), "bad.csv", &["u1,p1,0.5,one"]);
        let reader = CsvReader::new(&file_config(""));
        let items: Vec<Result<Record>> = reader.open(&path).unwrap().collect();
        assert_eq!(items.len(), 1);
        let err = items.into_iter().next().unwrap().unwrap_err();
        match err {
            SourceError::Csv { line, message, .. } => {
                assert_eq!(line, 2);
                assert!(message.contains("clicked"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn csv_reader_handles_gzip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("part-0.csv.gz");
        let mut encoder = flate2::write::GzEncoder::new(
            File::create(&path).unwrap(),
            flate2::Compression::default(),
        );
        encoder
            .write_all(b"user_id,post_id,score,clicked\nu1,p1,0.5,1\n")
            .unwrap();
        encoder.finish().unwrap();

        let reader = CsvReader::new(&file_config(""));
        let records: Vec<Record> = reader
            .open(&path)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get("user_id"), Some(&FieldValue::Str("u1".into())));
    }

    #[test]
    fn shard_predicate_partitions_rows() {
        let rows = table_rows(100);
        let num_shards = 4;
        for row in &rows {
            let mut owners = 0;
            for shard in 0..num_shards {
                let predicate = ShardPredicate::new("user_id", shard, num_shards).unwrap();
                if predicate.matches(row).unwrap() {
                    owners += 1;
                }
            }
            assert_eq!(owners, 1, "row must land in exactly one shard");
        }
    }

    #[test]
    fn shard_predicate_is_stable() {
        let rows = table_rows(20);
        let predicate = ShardPredicate::new("user_id", 1, 3).unwrap();
        let first: Vec<bool> = rows.iter().map(|r| predicate.matches(r).unwrap()).collect();
        let second: Vec<bool> = rows.iter().map(|r| predicate.matches(r).unwrap()).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn file_events_mark_every_epoch() {
        let dir = tempfile::tempdir().unwrap();
        write_csv(dir.path(), "part-0.csv", &["u1,p1,0.5,1", "u2,p2,0.5,0"]);
        write_csv(dir.path(), "part-1.csv", &["u3,p3,0.5,1"]);
        let mut config = file_config("");
        config.epochs = 2;
        let pattern = dir.path().join("*.csv");
        let reader: Arc<dyn RecordReader> = Arc::new(CsvReader::new(&config));
        let source = ShardedBatchSource::from_files(
            &config,
            reader,
            pattern.to_str().unwrap(),
            0,
            1,
        )
        .unwrap();

        let events: Vec<SourceEvent> = source
            .events()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        let records = events
            .iter()
            .filter(|e| matches!(e, SourceEvent::Record(_)))
            .count();
        let ends = events
            .iter()
            .filter(|e| matches!(e, SourceEvent::EpochEnd))
            .count();
        assert_eq!(records, 6);
        assert_eq!(ends, 2);
        assert!(matches!(events.last(), Some(SourceEvent::EpochEnd)));
    }

    #[test]
    fn file_batches_flush_remainder_per_epoch() {
        let dir = tempfile::tempdir().unwrap();
        write_csv(
            dir.path(),
            "part-0.csv",
            &["u1,p1,0.5,1", "u2,p2,0.5,0", "u3,p3,0.5,1"],
        );
        let mut config = file_config("");
        config.epochs = 2;
        let pattern = dir.path().join("*.csv");
        let reader: Arc<dyn RecordReader> = Arc::new(CsvReader::new(&config));
        let source = ShardedBatchSource::from_files(
            &config,
            reader,
            pattern.to_str().unwrap(),
            0,
            1,
        )
        .unwrap();

        // 3 records per epoch, batch size 2: each epoch flushes its own
        // remainder of one.
        let sizes: Vec<usize> = source
            .batches()
            .collect::<Result<Vec<_>>>()
            .unwrap()
            .iter()
            .map(|batch| batch.len())
            .collect();
        assert_eq!(sizes, vec![2, 1, 2, 1]);
    }

    #[test]
    fn file_batches_drop_remainder_per_epoch() {
        let dir = tempfile::tempdir().unwrap();
        write_csv(
            dir.path(),
            "part-0.csv",
            &["u1,p1,0.5,1", "u2,p2,0.5,0", "u3,p3,0.5,1"],
        );
        let mut config = file_config("");
        config.epochs = 2;
        config.drop_remainder = true;
        let pattern = dir.path().join("*.csv");
        let reader: Arc<dyn RecordReader> = Arc::new(CsvReader::new(&config));
        let source = ShardedBatchSource::from_files(
            &config,
            reader,
            pattern.to_str().unwrap(),
            0,
            1,
        )
        .unwrap();
        let sizes: Vec<usize> = source
            .batches()
            .collect::<Result<Vec<_>>>()
            .unwrap()
            .iter()
            .map(|batch| batch.len())
            .collect();
        assert_eq!(sizes, vec![2, 2]);
    }

    #[test]
    fn table_batches_span_epoch_boundaries() {
        // 7 rows per scan, 2 epochs, batch size 4: repetition precedes
        // batching, so the second batch crosses the pass boundary and
        // only the stream end leaves a remainder.
        let config = table_config("");
        let table: Arc<dyn TableSource> = Arc::new(MemoryTableSource::new(table_rows(7)));
        let source = ShardedBatchSource::from_table(&config, table, 0, 1).unwrap();
        let sizes: Vec<usize> = source
            .batches()
            .collect::<Result<Vec<_>>>()
            .unwrap()
            .iter()
            .map(|batch| batch.len())
            .collect();
        assert_eq!(sizes, vec![4, 4, 4, 2]);
    }

    #[test]
    fn table_shards_partition_the_row_stream() {
        let config = table_config("");
        let rows = table_rows(50);
        let table: Arc<dyn TableSource> = Arc::new(MemoryTableSource::new(rows.clone()));

        let mut seen = HashSet::new();
        let mut total = 0;
        for shard in 0..3 {
            let source =
                ShardedBatchSource::from_table(&config, Arc::clone(&table), shard, 3).unwrap();
            for event in source.events() {
                if let SourceEvent::Record(record) = event.unwrap() {
                    let user = record.get("user_id").unwrap().render();
                    total += 1;
                    seen.insert((shard, user));
                }
            }
        }
        // 2 epochs over 50 rows, every row in exactly one shard.
        assert_eq!(total, 100);
        let users: HashSet<&str> = seen.iter().map(|(_, user)| user.as_str()).collect();
        assert_eq!(users.len(), 50);
        for user in users {
            let shards: Vec<usize> = seen
                .iter()
                .filter(|(_, u)| u.as_str() == user)
                .map(|(s, _)| *s)
                .collect();
            assert_eq!(shards.len(), 1);
        }
    }

    #[test]
    fn shuffle_buffer_is_seed_deterministic() {
        let items: Vec<i32> = (0..100).collect();
        let a: Vec<i32> = ShuffleBuffer::new(items.clone().into_iter(), 32, 7).collect();
        let b: Vec<i32> = ShuffleBuffer::new(items.clone().into_iter(), 32, 7).collect();
        let c: Vec<i32> = ShuffleBuffer::new(items.clone().into_iter(), 32, 8).collect();
        assert_eq!(a, b);
        assert_ne!(a, c);

        let mut sorted = a.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, items);
    }

    #[test]
    fn wrong_format_constructors_fail() {
        let config = file_config("");
        let table: Arc<dyn TableSource> = Arc::new(MemoryTableSource::default());
        let err = ShardedBatchSource::from_table(&config, table, 0, 1).unwrap_err();
        assert!(matches!(err, SourceError::NotTable { .. }));

        let config = table_config("");
        let reader: Arc<dyn RecordReader> = Arc::new(CsvReader::new(&config));
        let err = ShardedBatchSource::from_files(&config, reader, "*", 0, 1).unwrap_err();
        assert!(matches!(err, SourceError::NotFileBased { .. }));
    }
}
