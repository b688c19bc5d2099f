//! Error types for smimegw

use thiserror::Error;

/// Main error type for smimegw
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Result type alias for smimegw
pub type Result<T> = std::result::Result<T, Error>;
