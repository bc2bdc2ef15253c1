//! Error types for transformer-tts.

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
///
/// Every variant is fatal for the call that produced it; the forward pass
/// never returns partial results.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Candle tensor/model error.
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),

    /// Two tensors that must share a dimension disagree.
    #[error("shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// A supplied mask cannot gate the tensors of its role.
    #[error("mask `{role}` has shape {actual:?}, expected {expected:?}")]
    MaskShapeMismatch {
        role: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// A position id indexes past the end of the sinusoid table.
    #[error("position id {position} outside positional table of length {max}")]
    PositionOutOfRange { position: u32, max: usize },

    /// Invalid configuration.
    #[error("config: {0}")]
    Config(String),

    /// Weight loading failure.
    #[error("weight loading: {0}")]
    WeightLoad(String),

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn shape(context: &'static str, expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            context,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }

    pub(crate) fn mask(role: &'static str, expected: &[usize], actual: &[usize]) -> Self {
        Self::MaskShapeMismatch {
            role,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}
