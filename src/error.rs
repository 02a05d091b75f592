//! Error types for Snare

use std::io;
use thiserror::Error;

/// Result type for Snare operations
pub type Result<T> = std::result::Result<T, SnareError>;

/// Errors that can occur in Snare
///
/// Capture timeouts are not represented here: a timed-out capture is a normal
/// outcome carrying whatever was buffered.
#[derive(Debug, Error)]
pub enum SnareError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The pooled rendering resource could not be created, reached or destroyed
    #[error("Rendering resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// The operation was cancelled by its caller
    #[error("Operation cancelled")]
    Cancelled,

    /// Invalid interception or poller configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// URL pattern failed to compile
    #[error("Invalid URL pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    /// Configuration file error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Replay fixture could not be loaded
    #[error("Invalid replay fixture: {0}")]
    InvalidFixture(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl SnareError {
    /// Shorthand for a [`SnareError::ResourceUnavailable`] with a message
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::ResourceUnavailable(message.into())
    }

    /// Whether this error is a caller-initiated cancellation
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
