//! Adapter error types.
//!
//! Configuration errors are raised synchronously by the constructor.
//! Authentication errors poison the adapter for its whole lifetime.
//! Transport and I/O errors are local to the call that produced them.

use thiserror::Error;

/// Errors surfaced by [`crate::adapter::StorageAdapter`].
#[derive(Debug, Error)]
pub enum AdapterError {
    /// A required option is missing or invalid.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// The credential exchange with the identity provider failed.
    #[error("credential exchange failed: {0}")]
    Authentication(String),

    /// A single upload or delete request failed.
    #[error("storage request failed: {0}")]
    Transport(#[from] anyhow::Error),

    /// The attachment descriptor cannot be turned into a request.
    #[error("invalid attachment: {0}")]
    InvalidAttachment(String),

    /// The attachment's local byte source could not be opened.
    #[error("failed to open attachment: {0}")]
    Io(#[from] std::io::Error),
}

impl AdapterError {
    /// Short label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AdapterError::Configuration(_) => "configuration",
            AdapterError::Authentication(_) => "authentication",
            AdapterError::Transport(_) => "transport",
            AdapterError::InvalidAttachment(_) => "attachment",
            AdapterError::Io(_) => "io",
        }
    }
}

/// Convenience alias for adapter results.
pub type Result<T> = std::result::Result<T, AdapterError>;
