//! Error types for the ENAS search engine

use thiserror::Error;

/// Result type alias for ENAS operations
pub type Result<T> = std::result::Result<T, EnasError>;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum EnasError {
    /// An operator id outside the six-branch search space. Fatal: the
    /// shared network has no parameters for such a branch.
    #[error("invalid operator id {id}, expected 0..=5")]
    InvalidOperator { id: usize },

    /// A descriptor whose shape does not match the network it is applied
    /// to, e.g. a skip vector of the wrong length. Caught eagerly at
    /// construction, never mid-forward.
    #[error("malformed architecture at layer {layer}: expected {expected}, got {actual}")]
    MalformedArchitecture {
        layer: usize,
        expected: String,
        actual: String,
    },

    /// Skip-fusion operands with unequal shapes. Only reachable when the
    /// pooling-checkpoint reconciliation invariant is broken upstream.
    #[error("shape mismatch during skip fusion: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("data error: {0}")]
    Data(String),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EnasError {
    fn from(err: serde_json::Error) -> Self {
        EnasError::Serialization(err.to_string())
    }
}
