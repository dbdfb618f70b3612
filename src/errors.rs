// src/errors.rs

//! Crate-wide error aliases and helpers.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Wait for command '{0}' was cancelled")]
    WaitCancelled(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Error returned by a command handler.
///
/// `Cancelled` is terminal and never retried; `Failed` is subject to the
/// retry-on-exception policy.
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl HandlerError {
    /// Convenience for handlers that fail with a plain message.
    pub fn msg(message: impl std::fmt::Display) -> Self {
        HandlerError::Failed(anyhow::anyhow!("{message}"))
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, DispatchError>;
