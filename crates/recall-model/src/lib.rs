//! Embedding store, attention pooling, and the two-tower scorer for
//! the recall engine.
//!
//! The model side of the engine is deliberately small: a row-major
//! [`Tensor`], seeded initializers, an [`EmbeddingStore`] that owns
//! every embedding table and resolves table reuse to shared ids, the
//! per-sequence combine paths (sum and attention pooling), and the
//! [`TwoTowerScorer`] that reduces a feature batch to one score per
//! record. [`EngineContext`] wires all of it to the data pipeline.
//!
//! Construction is deterministic: the same configuration and seed
//! rebuild identical parameters, so a restored state and a rebuilt
//! engine score identically.
//!
//! ```
//! use recall_core::Config;
//! use recall_data::{FeatureBatch, Record};
//! use recall_model::EngineContext;
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
//!
//! let context = EngineContext::build(config).unwrap();
//! let record = Record::new()
//!     .with("user_id", "u-42")
//!     .with("post_id", "p-7")
//!     .with("clicked", 1i64);
//! let transformed = context.transformer().transform(&record).unwrap();
//! let batch = FeatureBatch::from_records(vec![transformed]).unwrap();
//!
//! let scores = context.scorer().score(&batch).unwrap();
//! assert_eq!(scores.shape(), &[1]);
//! ```
//!
//! # Modules
//!
//! - [`error`] - Model error type shared by every module
//! - [`tensor`] - Minimal row-major `f32` tensor
//! - [`init`] - Seeded weight initializers
//! - [`dense`] - Fully connected layer
//! - [`mlp`] - Tower projection stacks
//! - [`attention`] - Multi-head attention pooling and layer norm
//! - [`embedding`] - Embedding tables, registry, lookup and combine
//! - [`scorer`] - The two-tower scorer and its persisted state
//! - [`context`] - Engine construction in dependency order

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod attention;
pub mod context;
pub mod dense;
pub mod embedding;
pub mod error;
pub mod init;
pub mod mlp;
pub mod scorer;
pub mod tensor;

// Re-export main types for convenience
pub use attention::{AttentionPooling, LayerNorm, KEY_DIM, NUM_HEADS};
pub use context::EngineContext;
pub use dense::Dense;
pub use embedding::{EmbeddingStore, EmbeddingTable, EmbeddingTableState, TableId};
pub use error::{ModelError, Result};
pub use init::{Initializer, TruncatedNormal, Zeros, DEFAULT_SEED};
pub use mlp::{ActivationType, MlpConfig, TowerMlp};
pub use scorer::{LossBreakdown, ModelState, TowerOutput, TwoTowerScorer, STATE_VERSION};
pub use tensor::Tensor;

/// Prelude module for convenient imports.
///
/// Import everything commonly needed with:
/// ```
/// use recall_model::prelude::*;
/// ```
pub mod prelude {
    pub use crate::attention::AttentionPooling;
    pub use crate::context::EngineContext;
    pub use crate::embedding::{EmbeddingStore, EmbeddingTable, EmbeddingTableState, TableId};
    pub use crate::error::ModelError;
    pub use crate::init::{Initializer, TruncatedNormal, Zeros};
    pub use crate::mlp::{ActivationType, MlpConfig, TowerMlp};
    pub use crate::scorer::{LossBreakdown, ModelState, TowerOutput, TwoTowerScorer};
    pub use crate::tensor::Tensor;
}
