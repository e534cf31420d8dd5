//! Error types for sessgraph.

use thiserror::Error;

/// sessgraph error type.
#[derive(Debug, Error)]
pub enum Error {
    /// Candle tensor error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Dimension mismatch between a batch component and what the layer expects.
    #[error("dimension mismatch in {what}: expected {expected}, got {got}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    /// Malformed session (empty, or a real item after padding).
    #[error("invalid session: {0}")]
    InvalidSession(String),

    /// A batch with no sessions.
    #[error("empty batch")]
    EmptyBatch,

    /// Invalid configuration.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Training error.
    #[error("training error: {0}")]
    Training(String),

    /// I/O error while reading a dataset or config.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed JSON dataset or config.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

pub(crate) fn check_dim(what: &'static str, expected: usize, got: usize) -> Result<()> {
    if expected == got {
        Ok(())
    } else {
        Err(Error::DimensionMismatch {
            what,
            expected,
            got,
        })
    }
}
