//! Errors from configuration loading.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A config file could not be read or parsed.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A resolved setting cannot be used.
    #[error("Invalid setting {field}: {reason}")]
    InvalidSetting { field: &'static str, reason: String },
}
