//! Unified error types for recordshell

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for recordshell operations
#[derive(Error, Debug)]
pub enum Error {
    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("System call failed: {0}")]
    Nix(#[from] nix::Error),

    // Invocation errors
    #[error("Usage: {0}")]
    Usage(String),

    #[error("{0}")]
    Privilege(String),

    #[error("{0}")]
    Environment(String),

    // Config errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to read config file '{path}': {source}")]
    ConfigRead { path: PathBuf, source: io::Error },

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config validation failed: {0}")]
    ConfigValidation(String),

    // Network setup errors
    #[error("No free address left in {0}")]
    ResourceExhausted(String),

    #[error("{operation} failed: {message}")]
    PrivilegedOperation { operation: String, message: String },

    // Supervision errors
    #[error("Unknown signal received: {0}")]
    UnknownSignal(i32),

    // Proxy errors
    #[error("Proxy error: {0}")]
    Proxy(String),
}

impl Error {
    /// Build a `PrivilegedOperation` error from an operation name and any displayable cause
    pub fn privileged(operation: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Error::PrivilegedOperation {
            operation: operation.into(),
            message: message.to_string(),
        }
    }
}

/// Result type alias for recordshell operations
pub type Result<T> = std::result::Result<T, Error>;
