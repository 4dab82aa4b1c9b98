//! Error types

use thiserror::Error;

/// Errors surfaced by the inference core and the data layer.
#[derive(Error, Debug)]
pub enum HmmError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The emission update could not bracket a root for `p0`. The fit is
    /// aborted and the model parameters are left unchanged;
    /// `log_likelihood` is the value from the last completed iteration.
    #[error("cannot bracket emission root for state {state}")]
    BracketingFailed { state: usize, log_likelihood: f64 },

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, HmmError>;
