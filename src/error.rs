use thiserror::Error;

/// Errors raised by the masking and clustering layers.
///
/// File handling and the CLI use `anyhow` on top of this; everything below
/// the loader reports through `RenaError`.
#[derive(Debug, Error)]
pub enum RenaError {
    /// A constructor parameter is out of range. Raised at fit time.
    #[error("{0}")]
    InvalidParameter(String),

    /// Not enough samples or features to build a clustering.
    #[error("insufficient data: {0}")]
    InsufficientData(String),

    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("{0} is not fitted yet; call `fit` first")]
    NotFitted(&'static str),

    #[error("mask selects no voxels")]
    EmptyMask,
}

pub type Result<T> = std::result::Result<T, RenaError>;
