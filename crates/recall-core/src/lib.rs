//! Core types for the recall two-tower scoring engine.
//!
//! This crate holds what every other layer of the engine depends on: the
//! declarative configuration schema with its validation rules, the error
//! taxonomy for configuration problems, and the stable fingerprint hash
//! used for feature bucketing and shard assignment.
//!
//! # Modules
//!
//! - [`config`] - Configuration schema, YAML loading, and validation
//! - [`error`] - Configuration error types
//! - [`fingerprint`] - Stable 64-bit fingerprints
//!
//! # Example
//!
//! ```
//! use recall_core::prelude::*;
//!
//! let yaml = r#"
//! epochs: 1
//! global_batch_size: 2
//! label: label
//! format: csv
//! model:
//!   features:
//!     uid: { type: embedding_lookup, belongs_to: user, hash: true,
//!            vocab_size: 100, embedding_dim: 4 }
//!     pid: { type: embedding_lookup, belongs_to: post, hash: true,
//!            vocab_size: 100, embedding_dim: 4 }
//! dataset_features:
//!   uid: { type: str }
//!   pid: { type: str }
//!   label: { type: int }
//! "#;
//! let config = Config::from_yaml_str(yaml).unwrap();
//! config.validate().unwrap();
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod fingerprint;

pub use config::{
    ColumnConfig, ColumnType, CombineMode, Compression, Config, EmbeddingBackendKind,
    EmbeddingFeature, FeatureConfig, FeatureKind, LossKind, ModelConfig, SourceFormat, Tower,
};
pub use error::{ConfigError, Result};
pub use fingerprint::{bucket, fingerprint64};

/// Commonly used types, importable in one line.
pub mod prelude {
    pub use crate::config::{
        ColumnConfig, ColumnType, CombineMode, Config, EmbeddingBackendKind, EmbeddingFeature,
        FeatureConfig, FeatureKind, LossKind, ModelConfig, SourceFormat, Tower,
    };
    pub use crate::error::ConfigError;
    pub use crate::fingerprint::{bucket, fingerprint64};
}
