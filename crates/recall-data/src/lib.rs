//! Record pipeline for the recall two-tower scorer.
//!
//! This crate turns raw training data into fixed-shape feature batches.
//! It covers vocabulary loading with out-of-vocabulary bucketing, the
//! schema-driven record transformation, deterministic sharded sources
//! over file globs and warehouse tables, and a staged multi-threaded
//! pipeline that preserves stream order.
//!
//! # Overview
//!
//! A validated [`recall_core::Config`] drives everything: the
//! [`VocabularyStore`] loads every referenced vocabulary once, the
//! [`RecordTransformer`] compiles the per-feature stage plan, and a
//! [`ShardedBatchSource`] enumerates this worker's slice of the input.
//! [`TransformPipeline`] wires the three together behind bounded
//! queues.
//!
//! ```
//! use recall_core::Config;
//! use recall_data::{Record, RecordTransformer, VocabularyStore};
//!
//! let config = Config::from_yaml_str(
//!     r#"
//! epochs: 1
//! global_batch_size: 2
//! label: clicked
//! format: csv
//! model:
//!   features:
//!     user_id:
//!       type: embedding_lookup
//!       belongs_to: user
//!       hash: true
//!       vocab_size: 100
//!       embedding_dim: 8
//!     post_id:
//!       type: embedding_lookup
//!       belongs_to: post
//!       hash: true
//!       vocab_size: 100
//!       embedding_dim: 8
//! dataset_features:
//!   user_id: { type: str }
//!   post_id: { type: str }
//!   clicked: { type: int }
//! "#,
//! )
//! .unwrap();
//! config.validate().unwrap();
//!
//! let transformer = RecordTransformer::new(&config, &VocabularyStore::empty()).unwrap();
//! let record = Record::new()
//!     .with("user_id", "u-42")
//!     .with("post_id", "p-7")
//!     .with("clicked", 1i64);
//! let transformed = transformer.transform(&record).unwrap();
//! assert_eq!(transformed.label, 1.0);
//! ```
//!
//! # Modules
//!
//! - [`record`] - Raw and transformed record types, [`FeatureBatch`]
//! - [`vocab`] - Vocabulary tables and the per-run store
//! - [`transform`] - The schema-driven record transformation
//! - [`source`] - Sharded file and table sources
//! - [`interleave`] - Round-robin stream interleaving
//! - [`queue`] - Bounded FIFO handoff queue
//! - [`pipeline`] - The staged parallel transform pipeline

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod interleave;
pub mod pipeline;
pub mod queue;
pub mod record;
pub mod source;
pub mod transform;
pub mod vocab;

// Re-export main types for convenience
pub use interleave::Interleave;
pub use pipeline::{PipelineOptions, TransformPipeline};
pub use queue::{BoundedQueue, QueueClosed};
pub use record::{FeatureBatch, FeatureValue, FieldValue, IndexMatrix, Record, TransformedRecord};
pub use source::{
    CsvReader, MemoryTableSource, RecordIter, RecordReader, ShardPredicate, ShardedBatchSource,
    ShuffleBuffer, SourceError, SourceEvent, TableSource, FILE_SHUFFLE_SEED,
};
pub use transform::{RecordTransformer, TransformError};
pub use vocab::{VocabError, VocabularyStore, VocabularyTable};

/// Prelude module for convenient imports.
///
/// Import everything commonly needed with:
/// ```
/// use recall_data::prelude::*;
/// ```
pub mod prelude {
    pub use crate::pipeline::{PipelineOptions, TransformPipeline};
    pub use crate::record::{
        FeatureBatch, FeatureValue, FieldValue, IndexMatrix, Record, TransformedRecord,
    };
    pub use crate::source::{
        CsvReader, MemoryTableSource, RecordReader, ShardedBatchSource, SourceError, TableSource,
    };
    pub use crate::transform::{RecordTransformer, TransformError};
    pub use crate::vocab::{VocabError, VocabularyStore, VocabularyTable};
}
