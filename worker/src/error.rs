//! Worker error types

use shared::SharedError;
use thiserror::Error;

/// Result type for worker operations
pub type WorkerResult<T> = Result<T, WorkerError>;

/// Worker error types
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Worker not initialized")]
    NotInitialized,

    #[error("Unknown method: {method}")]
    UnknownMethod { method: String },

    #[error("Invalid parameters for {method}: {message}")]
    InvalidParams { method: String, message: String },

    #[error("Method registry error: {message}")]
    RegistryError { message: String },

    #[error("Broker session error: {message}")]
    SessionError { message: String },

    #[error("Broker rejected {operation} with status {status}: {message}")]
    BrokerError {
        operation: String,
        status: u16,
        message: String,
    },

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Protocol error: {0}")]
    Protocol(#[from] SharedError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl WorkerError {
    pub fn invalid_params(method: &str, message: impl Into<String>) -> Self {
        WorkerError::InvalidParams {
            method: method.to_string(),
            message: message.into(),
        }
    }

    pub fn registry(message: impl Into<String>) -> Self {
        WorkerError::RegistryError {
            message: message.into(),
        }
    }
}
