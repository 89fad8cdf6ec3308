//! Error types emitted by attention implementations.

use thiserror::Error;

/// Attention-specific error category.
#[derive(Error, Debug)]
pub enum AttentionError {
    /// Head or hidden dimensions disagree between inputs, or a tensor does not
    /// follow the documented layout.
    #[error("shape mismatch: {context}")]
    ShapeMismatch { context: String },
    /// A structural argument is unusable, e.g. query heads not divisible by
    /// key/value heads.
    #[error("invalid argument: {context}")]
    InvalidArgument { context: String },
    /// Every key was masked for at least one query row and the configured
    /// policy refuses to zero-fill.
    #[error("{rows} attention rows are fully masked")]
    NumericDegenerate { rows: usize },
    /// The kernel does not support the requested data type.
    #[error("unsupported dtype {requested}")]
    UnsupportedDType { requested: String },
    /// Positional encoding failure propagated from the embedding crate.
    #[error(transparent)]
    Embedding(#[from] embedding::EmbeddingError),
    /// A backend-specific failure propagated to the caller.
    #[error("backend error: {0}")]
    Backend(#[from] candle_core::Error),
}

impl AttentionError {
    pub(crate) fn shape(context: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            context: context.into(),
        }
    }

    pub(crate) fn invalid(context: impl Into<String>) -> Self {
        Self::InvalidArgument {
            context: context.into(),
        }
    }
}
