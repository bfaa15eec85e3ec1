//! Error types for DPS

use thiserror::Error;

/// Result type alias for DPS operations
pub type Result<T> = std::result::Result<T, DpsError>;

/// Main error type for shared DPS functionality
#[derive(Error, Debug)]
pub enum DpsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown deposit status: {0}")]
    UnknownStatus(String),

    #[error("Unknown transport kind: {0}")]
    UnknownTransport(String),

    #[error("Unknown resource role: {0}")]
    UnknownRole(String),
}
