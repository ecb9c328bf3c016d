//! Core error model.

use thiserror::Error;

/// Result type used across the core primitives.
pub type CoreResult<T> = Result<T, CoreError>;

/// Core-level error.
///
/// Keep this focused on deterministic validation failures. Transport and
/// storage concerns belong to the infrastructure crates.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// An identifier was invalid (e.g. parse failure, empty string).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A required field was absent from an opaque payload.
    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// A value failed validation.
    #[error("validation failed: {0}")]
    Validation(String),
}

impl CoreError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}
