use thiserror::Error;

/// Domain error type for the forest crates.
///
/// Mirrors the error-kind table of the specification: each variant names
/// the condition that produced it rather than a generic message, so
/// callers can match on kind instead of parsing text.
#[derive(Debug, Error, Clone)]
pub enum ForestError {
    #[error("required tensor slot is empty")]
    Empty,

    #[error("shape error: {0}")]
    Shape(String),

    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error("not initialized: {0}")]
    NotInitialized(String),

    #[error("no solution: {0}")]
    NoSolution(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("corrupted stream: {0}")]
    Corruption(String),

    #[error("internal invariant violated: {0}")]
    Internal(String),

    /// A linear-regression leaf's support interval must be released
    /// before it can be serialized (see the freeze rule in the
    /// persisted-state section of the spec).
    #[error("linear-regression leaf is not frozen: {0}")]
    NotFrozen(String),
}

pub type ForestResult<T> = Result<T, ForestError>;
