//! Error types for the coordination layer

use thiserror::Error;

/// Coordination error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Transport or server error on `add/user`, `remove/user` or `update/user`
    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    /// Push stream could not be opened or broke while streaming
    #[error("Stream failed: {0}")]
    StreamFailed(String),

    /// This follower's connection group diverged from the leader's and re-attachment failed
    #[error("Connection drift: {0}")]
    ReconciliationDrift(String),

    #[error("Bus error: {0}")]
    Bus(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Pub/sub worker has shut down")]
    Closed,
}

/// Result type for coordination operations
pub type Result<T> = std::result::Result<T, Error>;
