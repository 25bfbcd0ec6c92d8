//! Error types for the Matrixon sync engine
//!
//! Every fallible operation in the engine returns [`Result`]. The retry loop
//! never lets one of these escape to the consumer; it logs [`Error::kind`] and
//! backs off instead.

use std::io;
use thiserror::Error;

/// Sync engine error types
#[derive(Debug, Error)]
pub enum Error {
    /// Transport failure (connection refused, timeout, TLS, ...)
    #[error("Transport error: {0}")]
    Transport(String),

    /// The homeserver answered with a non-success status
    #[error("HTTP {status} ({errcode}): {message}")]
    Http {
        status: u16,
        errcode: String,
        message: String,
    },

    /// The homeserver answered with something we could not understand
    #[error("Bad server response: {0}")]
    BadServerResponse(String),

    /// Key-value persistence failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The crypto engine refused to decrypt an event
    #[error("Decryption error: {0}")]
    Decryption(String),

    /// An operation needed the crypto engine but none is attached
    #[error("Crypto engine not ready")]
    CryptoNotReady,

    /// A windowed list operation disagrees with the local page table
    #[error("List {list} out of sync: {detail}")]
    ListConsistency { list: String, detail: String },

    /// Operation not allowed in the current lifecycle state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for sync engine operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Short, stable class name used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Transport(_) => "transport",
            Error::Http { .. } => "http",
            Error::BadServerResponse(_) => "bad_response",
            Error::Storage(_) => "storage",
            Error::Serialization(_) => "serialization",
            Error::Config(_) => "config",
            Error::Decryption(_) => "decryption",
            Error::CryptoNotReady => "crypto_not_ready",
            Error::ListConsistency { .. } => "list_consistency",
            Error::InvalidState(_) => "invalid_state",
            Error::Io(_) => "io",
        }
    }

    /// Build a list consistency error.
    pub fn list_consistency(list: impl Into<String>, detail: impl Into<String>) -> Self {
        Error::ListConsistency {
            list: list.into(),
            detail: detail.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        Error::Transport(format!("timed out: {err}"))
    }
}
