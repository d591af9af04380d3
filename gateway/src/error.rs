//! Gateway-specific error types

use shared::{AccountId, SharedError};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Worker process for account {account_id} failed to start: {reason}")]
    ProcessStartup { account_id: AccountId, reason: String },

    #[error("Worker communication failed: {message}")]
    ProcessCommunication { message: String },

    #[error("Task {method} for account {account_id} timed out after {timeout:?}")]
    TaskTimeout {
        account_id: AccountId,
        method: String,
        timeout: Duration,
    },

    #[error("Task {method} for account {account_id} failed: {message}")]
    TaskExecution {
        account_id: AccountId,
        method: String,
        message: String,
    },

    #[error("Maximum processes ({max}) reached")]
    Capacity { max: usize },

    #[error("Token refresh failed: {message}")]
    TokenRefresh { status: Option<u16>, message: String },

    #[error("Token endpoint rate limited, retry after {retry_after_secs}s")]
    TokenRateLimit { retry_after_secs: u64 },

    #[error("No accounts available for {operation}")]
    NoAccountsAvailable { operation: String },

    #[error("Operation {operation} is not supported by this route")]
    OperationNotSupported { operation: String },

    #[error("Account not found: {account_id}")]
    AccountNotFound { account_id: AccountId },

    #[error("Account {account_id} is not active ({status})")]
    AccountInactive { account_id: AccountId, status: String },

    #[error("Refresh record not found: {record_id}")]
    RecordNotFound { record_id: Uuid },

    #[error("Cannot {action} a refresh in state {state}")]
    InvalidTransition { state: String, action: String },

    #[error("Account store error: {message}")]
    StoreError { message: String },

    #[error("Credential cipher error: {message}")]
    CipherError { message: String },

    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },

    #[error("Shared component error: {0}")]
    SharedError(#[from] SharedError),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl GatewayError {
    pub fn config(message: impl Into<String>) -> Self {
        GatewayError::ConfigurationError {
            message: message.into(),
        }
    }

    pub fn communication(message: impl Into<String>) -> Self {
        GatewayError::ProcessCommunication {
            message: message.into(),
        }
    }

    pub fn store(message: impl Into<String>) -> Self {
        GatewayError::StoreError {
            message: message.into(),
        }
    }

    pub fn startup(account_id: AccountId, reason: impl Into<String>) -> Self {
        GatewayError::ProcessStartup {
            account_id,
            reason: reason.into(),
        }
    }

    /// HTTP status carried by token endpoint failures, if any
    pub fn http_status(&self) -> Option<u16> {
        match self {
            GatewayError::TokenRefresh { status, .. } => *status,
            GatewayError::TokenRateLimit { .. } => Some(429),
            _ => None,
        }
    }

    /// Short machine-readable code persisted on failed refresh records
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::ProcessStartup { .. } => "process_startup",
            GatewayError::ProcessCommunication { .. } => "process_communication",
            GatewayError::TaskTimeout { .. } => "task_timeout",
            GatewayError::TaskExecution { .. } => "task_execution",
            GatewayError::Capacity { .. } => "capacity",
            GatewayError::TokenRefresh { .. } => "token_refresh",
            GatewayError::TokenRateLimit { .. } => "rate_limited",
            GatewayError::NoAccountsAvailable { .. } => "no_accounts",
            GatewayError::OperationNotSupported { .. } => "operation_not_supported",
            GatewayError::AccountNotFound { .. } => "account_not_found",
            GatewayError::AccountInactive { .. } => "account_inactive",
            GatewayError::RecordNotFound { .. } => "record_not_found",
            GatewayError::InvalidTransition { .. } => "invalid_transition",
            GatewayError::StoreError { .. } => "store",
            GatewayError::CipherError { .. } => "cipher",
            GatewayError::ConfigurationError { .. } => "configuration",
            GatewayError::SharedError(_) => "shared",
            GatewayError::IoError(_) => "io",
            GatewayError::JsonError(_) => "json",
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
