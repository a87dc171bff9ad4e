//! Error types for configuration parsing and validation.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading or validating an engine configuration.
///
/// Validation is fail-fast: the first violated rule is returned and nothing
/// downstream (vocabulary loading, table construction, data reading) runs.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Reading the configuration document from disk failed.
    #[error("failed to read config {path}: {source}")]
    Io {
        /// Path that could not be read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The YAML document could not be deserialized into the schema.
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A model feature has no matching column in `dataset_features`.
    #[error("feature '{feature}' is not declared in dataset_features")]
    UnknownColumn {
        /// The offending feature name.
        feature: String,
    },

    /// A feature option was set without the option it depends on.
    #[error("feature '{feature}': '{field}' requires '{requires}'")]
    MissingField {
        /// The offending feature name.
        feature: String,
        /// The option that was set.
        field: &'static str,
        /// The option that must also be set.
        requires: &'static str,
    },

    /// A `reuse_vocab` or `reuse_embedding` target does not exist.
    #[error("feature '{feature}': '{field}' references unknown feature '{target}'")]
    UnknownReference {
        /// The offending feature name.
        feature: String,
        /// The referencing field (`reuse_vocab` or `reuse_embedding`).
        field: &'static str,
        /// The missing target feature.
        target: String,
    },

    /// A reuse target exists but cannot be reused.
    #[error("feature '{feature}' cannot reuse '{target}': {reason}")]
    InvalidReuse {
        /// The offending feature name.
        feature: String,
        /// The reuse target.
        target: String,
        /// Why the target is unusable.
        reason: String,
    },

    /// The configured label column is not declared in `dataset_features`.
    #[error("label column '{label}' is not declared in dataset_features")]
    UnknownLabel {
        /// The configured label column.
        label: String,
    },

    /// A numeric field that must be positive is zero.
    #[error("'{field}' must be positive")]
    NonPositive {
        /// The offending field.
        field: &'static str,
    },

    /// A tower ended up with no features assigned to it.
    #[error("tower '{tower}' has no features")]
    EmptyTower {
        /// The empty tower.
        tower: String,
    },

    /// Catch-all for rules that do not fit the variants above.
    #[error("{message}")]
    Invalid {
        /// Human-readable description of the violation.
        message: String,
    },
}

/// Result alias for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;
