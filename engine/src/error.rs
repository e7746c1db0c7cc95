//! Error kinds shared across the engine, per the propagation policy: per-series
//! and per-rule failures are captured locally, while per-run failures (fetch,
//! timeout, cancellation) surface as a terminal [`EngineError`].

use thiserror::Error;

/// Result type alias used throughout the engine crate.
pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error, Clone)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("monitoring provider transient failure: {0}")]
    ProviderTransient(String),

    #[error("monitoring provider permanent failure: {0}")]
    ProviderPermanent(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Whether a retry combinator should attempt this call again.
    ///
    /// Timeouts and transient provider failures are worth retrying;
    /// cancellation, permanent provider failures, bad input, and unclassified
    /// internal errors are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Timeout(_) | EngineError::ProviderTransient(_))
    }
}
