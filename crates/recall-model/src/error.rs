//! Error types for model construction and scoring.

use thiserror::Error;

/// Errors raised while building or running the model.
#[derive(Error, Debug)]
pub enum ModelError {
    /// A tensor was created from data that does not fill its shape.
    #[error("shape {shape:?} holds {expected} values, got {actual}")]
    Shape {
        /// The requested shape.
        shape: Vec<usize>,
        /// Values the shape requires.
        expected: usize,
        /// Values actually supplied.
        actual: usize,
    },

    /// A layer received input of the wrong shape.
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// The shape the layer expects.
        expected: Vec<usize>,
        /// The shape it was handed.
        actual: Vec<usize>,
    },

    /// A layer was configured with impossible dimensions.
    #[error("invalid layer: {message}")]
    InvalidLayer {
        /// What is wrong with the configuration.
        message: String,
    },

    /// An embedding index fell outside its table.
    #[error("feature '{feature}': index {index} outside table with {rows} rows")]
    IndexOutOfRange {
        /// The feature being looked up.
        feature: String,
        /// The offending index.
        index: i64,
        /// Rows in the table.
        rows: usize,
    },

    /// A feature name the model was not built with.
    #[error("unknown feature '{feature}'")]
    UnknownFeature {
        /// The unrecognized name.
        feature: String,
    },

    /// A batch is missing a feature the schema declares.
    #[error("feature '{feature}' missing from batch")]
    MissingFeature {
        /// The absent feature.
        feature: String,
    },

    /// The two towers end at different widths, so their dot product is
    /// undefined.
    #[error("user tower ends at {user} dims but post tower at {post}")]
    TowerMismatch {
        /// Output width of the user tower.
        user: usize,
        /// Output width of the post tower.
        post: usize,
    },

    /// Persisted state does not fit the configured model.
    #[error("state mismatch for '{name}': {reason}")]
    StateMismatch {
        /// The parameter or table being restored.
        name: String,
        /// Why it cannot be restored.
        reason: String,
    },

    /// The configuration failed validation.
    #[error(transparent)]
    Config(#[from] recall_core::ConfigError),

    /// A vocabulary could not be loaded.
    #[error(transparent)]
    Vocab(#[from] recall_data::VocabError),

    /// Record transformation could not be compiled.
    #[error(transparent)]
    Transform(#[from] recall_data::TransformError),

    /// The batch source could not be built.
    #[error(transparent)]
    Source(#[from] recall_data::SourceError),
}

/// Result alias for model operations.
pub type Result<T> = std::result::Result<T, ModelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_context() {
        let err = ModelError::IndexOutOfRange {
            feature: "post_id".to_string(),
            index: 510,
            rows: 510,
        };
        let text = err.to_string();
        assert!(text.contains("post_id"));
        assert!(text.contains("510"));

        let err = ModelError::TowerMismatch { user: 16, post: 8 };
        assert!(err.to_string().contains("16"));
    }
}
