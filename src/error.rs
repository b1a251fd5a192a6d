//! Error types for the Pylon host

use thiserror::Error;

/// Result type alias for Pylon operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the Pylon host
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed descriptor or host configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Protocol version or cookie mismatch during the handshake
    #[error("handshake error: {0}")]
    Handshake(String),

    /// Failed to spawn, signal, or reap a plugin process or container
    #[error("process error: {0}")]
    Process(String),

    /// RPC call failed or timed out
    #[error("communication error: {0}")]
    Communication(String),

    /// No port available or retries exhausted
    #[error("capacity error: {0}")]
    Capacity(String),

    /// Unknown plugin id
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate load for an id that is already loaded
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Whether this is the duplicate-load rejection
    #[must_use]
    pub const fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }

    /// Whether this is the unknown-id rejection
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
