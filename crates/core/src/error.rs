//! Core error model.

use thiserror::Error;

/// Result type used by the identity primitives.
pub type CoreResult<T> = Result<T, CoreError>;

/// Failure to construct or parse an identity primitive.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A service name was empty or contained forbidden characters.
    #[error("invalid service name: {0}")]
    InvalidServiceName(String),
}

impl CoreError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn invalid_service_name(msg: impl Into<String>) -> Self {
        Self::InvalidServiceName(msg.into())
    }
}
