//! Store error types

use redis::RedisError;

/// Error type returned by pluggable backends
pub type BackendError = Box<dyn std::error::Error + Send + Sync>;

/// Option store errors
#[derive(Debug, thiserror::Error)]
pub enum OptionError {
    #[error("Option name '{0}' is protected and cannot be modified")]
    ProtectedName(String),

    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
}

impl OptionError {
    /// True for the usage errors that halt an operation before any I/O
    pub fn is_protected_name(&self) -> bool {
        matches!(self, OptionError::ProtectedName(_))
    }
}
