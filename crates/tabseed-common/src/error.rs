//! Error types shared across tabseed crates

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, CommonError>;

/// Errors raised while building or validating shared model values
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommonError {
    #[error("Invalid table descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Invalid reconciliation policy '{0}': expected 'append' or 'replace'")]
    InvalidPolicy(String),
}

impl CommonError {
    /// Create an invalid descriptor error
    pub fn invalid_descriptor(msg: impl Into<String>) -> Self {
        Self::InvalidDescriptor(msg.into())
    }
}
