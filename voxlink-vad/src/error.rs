//! Error types for voice activity monitoring

use thiserror::Error;

/// Result type for monitor operations
pub type Result<T> = std::result::Result<T, VadError>;

/// Monitor error types
#[derive(Error, Debug, PartialEq)]
pub enum VadError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl VadError {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }
}
