//! Error types for the simulation core

use thiserror::Error;

/// Result type for simulation core operations
pub type SimResult<T> = Result<T, SimError>;

/// Errors raised while configuring or dispatching a simulated ECU
#[derive(Debug, Error)]
pub enum SimError {
    /// Object was built with an invalid combination of settings
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Malformed hex string
    #[error("Invalid hex string '{input}': {reason}")]
    InvalidHex { input: String, reason: String },

    /// Regular expression failed to compile
    #[error("Invalid request pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    /// Index or byte count past the end of the request
    #[error("Request access out of bounds: needed {needed} bytes, request has {len}")]
    OutOfBounds { needed: usize, len: usize },

    /// A service identifier was expected but the request is empty
    #[error("Empty request")]
    EmptyRequest,

    /// A storage key holds a value of another type
    #[error("Stored value for key '{0}' has a different type")]
    StorageType(String),

    /// Failure reported by a response handler
    #[error("Handler error: {0}")]
    Handler(String),

    /// Runtime facility unavailable (e.g. timer scheduled outside an async runtime)
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl SimError {
    /// Shorthand for a handler failure
    pub fn handler(msg: impl Into<String>) -> Self {
        SimError::Handler(msg.into())
    }
}
