use thiserror::Error;

/// Errors surfaced by the public fitting, sampling, and scoring entry
/// points. Recoverable numerical degeneracies (near-singular covariances,
/// collapsed component mass) are handled internally and never appear here.
#[derive(Debug, Error)]
pub enum Error {
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("singular matrix: {0}")]
    SingularMatrix(String),

    #[error("dependency graph contains a cycle")]
    CyclicGraph,

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("non-finite result during {0}")]
    NonFiniteResult(String),
}

pub type Result<T> = std::result::Result<T, Error>;
