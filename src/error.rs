//! Error types for the Glider service.

use thiserror::Error;

/// Main error type for Glider operations.
#[derive(Error, Debug)]
pub enum GliderError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The caller's address cannot be turned into a visitor key
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Network or connection failure talking to the shared store
    #[error("Shared store unavailable: {0}")]
    StoreUnavailable(String),

    /// An atomic operation failed on the store side
    #[error("Script execution failed: {0}")]
    ScriptExecution(String),

    /// A pub/sub payload that does not follow `<key>:<expiry>`
    #[error("Malformed pub/sub message: {0}")]
    MalformedMessage(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GliderError {
    /// Whether the error means the shared store could not serve the call.
    ///
    /// Script failures count as unavailability: the caller degrades the same way.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(
            self,
            GliderError::StoreUnavailable(_) | GliderError::ScriptExecution(_)
        )
    }
}

impl From<redis::RedisError> for GliderError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
            || err.is_timeout()
        {
            GliderError::StoreUnavailable(err.to_string())
        } else {
            GliderError::ScriptExecution(err.to_string())
        }
    }
}

/// Result type alias for Glider operations.
pub type Result<T> = std::result::Result<T, GliderError>;
