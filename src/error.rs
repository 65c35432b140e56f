//! Error types for Turnstile.

use thiserror::Error;

/// Main error type for Turnstile operations.
///
/// Rate limit violations are not errors: they are returned as decisions.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Invalid limits or thresholds; fatal at startup
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unexpected bookkeeping fault inside the limiter
    #[error("Internal limiter fault: {0}")]
    Internal(String),

    /// The background janitor task panicked or was aborted
    #[error("Janitor task failed: {0}")]
    Janitor(#[from] tokio::task::JoinError),
}

impl From<config::ConfigError> for TurnstileError {
    fn from(err: config::ConfigError) -> Self {
        TurnstileError::Config(err.to_string())
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
