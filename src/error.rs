//! Error types for the telemetry agent.
//!
//! Runtime conditions (corrupt records, rejected requests, pin mismatches) are
//! logged and absorbed by the subsystem that meets them. `AgentError` is what
//! surfaces to the host: contract violations at public entry points, invalid
//! configuration, and executor failures.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// The host passed an argument that can never be valid.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("agent is not initialized")]
    NotInitialized,

    #[error("executor '{0}' is shut down")]
    Shutdown(String),

    #[error("task aborted on '{0}'")]
    TaskAborted(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("certificate pinning error: {0}")]
    Pinning(String),
}

impl AgentError {
    pub fn invalid(message: impl Into<String>) -> Self {
        AgentError::InvalidArgument(message.into())
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for AgentError {
    fn from(e: bincode::Error) -> Self {
        AgentError::Serialization(e.to_string())
    }
}
