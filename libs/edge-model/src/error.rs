//! Model-level error type

use thiserror::Error;

/// Errors raised while parsing or validating model types
#[derive(Error, Debug, Clone)]
pub enum ModelError {
    /// Unknown or malformed enum/kind string
    #[error("Parse error: {0}")]
    Parse(String),

    /// Invalid configuration content
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// Expression parse or evaluation failure
    #[error("Expression error: {0}")]
    Expression(String),
}

pub type Result<T> = std::result::Result<T, ModelError>;
