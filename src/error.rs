//! Error types for alignment and feature extraction.

use thiserror::Error;

/// Errors produced by the alignment engine.
///
/// Data-insufficiency conditions (too few calibration points, empty bins,
/// empty samples) are handled locally by falling back to identity behaviour
/// and never surface as an [`Error`]. Invariant violations (duplicate sample
/// id inside one aligned point, non-monotonic scan axis) are programming
/// errors and panic instead.
#[derive(Debug, Error)]
pub enum Error {
    /// Worker thread pool could not be constructed.
    #[error("thread pool construction failed: {0}")]
    ThreadPool(String),

    /// A job submitted to the pool failed; aborts the enclosing barrier.
    #[error("alignment job failed: {0}")]
    JobFailed(String),

    /// Caller-supplied input violates a documented precondition.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Result type alias for alignment operations.
pub type Result<T> = std::result::Result<T, Error>;
