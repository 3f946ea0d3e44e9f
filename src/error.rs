//! Error types for the Gatekeeper service.

use thiserror::Error;

/// Main error type for Gatekeeper operations.
///
/// The limiter itself never fails; these cover startup and serving.
#[derive(Error, Debug)]
pub enum GatekeeperError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for GatekeeperError {
    fn from(err: config::ConfigError) -> Self {
        GatekeeperError::Config(err.to_string())
    }
}

/// Result type alias for Gatekeeper operations.
pub type Result<T> = std::result::Result<T, GatekeeperError>;
