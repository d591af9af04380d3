//! Trait definitions with mockall annotations for testing
//!
//! Every seam between the gateway's services and the outside world (worker
//! processes, the account store, credential encryption, the broker's token
//! endpoint) is a trait here so services can be wired with fakes in tests.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

use shared::{AccountId, ProcessId};

use crate::core::refresh::TokenRefreshRecord;
use crate::error::GatewayResult;
use crate::types::{Account, AccountFilter, DefaultRole, TokenUpdate};

/// What the pool asks a launcher to start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub process_id: ProcessId,
    pub account_id: AccountId,
}

/// A started worker: its frame pipes plus OS-level control
pub struct WorkerHandle {
    pub pid: Option<u32>,
    pub commands: Box<dyn AsyncWrite + Send + Unpin>,
    pub events: Box<dyn AsyncRead + Send + Unpin>,
    pub control: Box<dyn WorkerControl>,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle").field("pid", &self.pid).finish()
    }
}

/// Starts isolated worker processes bound to one account's session
#[mockall::automock]
#[async_trait::async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Spawn a worker; it has not necessarily reported ready yet
    async fn launch(&self, spec: &LaunchSpec) -> GatewayResult<WorkerHandle>;
}

/// OS-level control over a launched worker
#[mockall::automock]
#[async_trait::async_trait]
pub trait WorkerControl: Send + Sync {
    /// Whether the process is still running
    fn is_alive(&mut self) -> bool;

    /// Polite termination request (SIGTERM on unix)
    async fn terminate(&mut self) -> GatewayResult<()>;

    /// Forced termination
    async fn kill(&mut self) -> GatewayResult<()>;

    /// Wait up to `timeout` for exit; true if the process is gone
    async fn wait_for_exit(&mut self, timeout: Duration) -> bool;
}

/// Persistent account storage
#[mockall::automock]
#[async_trait::async_trait]
pub trait AccountStore: Send + Sync {
    async fn get_account(&self, account_id: AccountId) -> GatewayResult<Option<Account>>;

    /// Accounts matching `filter`, in stable store order
    async fn list_accounts(&self, filter: AccountFilter) -> GatewayResult<Vec<Account>>;

    async fn get_default_account(&self, role: DefaultRole) -> GatewayResult<Option<Account>>;

    /// Make `account_id` the only holder of the `role` default flag
    async fn set_default_account(&self, role: DefaultRole, account_id: AccountId) -> GatewayResult<()>;

    async fn update_tokens(&self, account_id: AccountId, update: TokenUpdate) -> GatewayResult<()>;

    async fn increment_error_count(&self, account_id: AccountId, message: String) -> GatewayResult<()>;

    async fn reset_error_count(&self, account_id: AccountId) -> GatewayResult<()>;
}

/// Persistent storage for token refresh audit records
#[mockall::automock]
#[async_trait::async_trait]
pub trait RefreshRecordStore: Send + Sync {
    async fn insert_record(&self, record: TokenRefreshRecord) -> GatewayResult<()>;

    async fn update_record(&self, record: TokenRefreshRecord) -> GatewayResult<()>;

    async fn get_record(&self, record_id: Uuid) -> GatewayResult<Option<TokenRefreshRecord>>;

    /// Newest first, optionally scoped to an account and a start time
    async fn list_records(
        &self,
        account_id: Option<AccountId>,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> GatewayResult<Vec<TokenRefreshRecord>>;
}

/// Encryption of stored secrets
#[mockall::automock]
pub trait CredentialCipher: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> GatewayResult<String>;

    fn decrypt(&self, ciphertext: &str) -> GatewayResult<String>;
}

/// Grant presented to the token endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenGrantKind {
    RefreshToken { refresh_token: String, client_id: String },
    ClientCredentials { client_id: String, client_secret: String },
}

impl TokenGrantKind {
    pub fn grant_type(&self) -> &'static str {
        match self {
            TokenGrantKind::RefreshToken { .. } => "refresh_token",
            TokenGrantKind::ClientCredentials { .. } => "client_credentials",
        }
    }
}

/// One token exchange against an account's broker server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRequest {
    pub server_url: String,
    pub grant: TokenGrantKind,
}

/// Successful token exchange
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<u64>,
    pub status_code: u16,
    pub response_time_ms: u64,
}

/// The broker's OAuth-style token endpoint
#[mockall::automock]
#[async_trait::async_trait]
pub trait TokenEndpoint: Send + Sync {
    /// Exchange a grant for a new access token, retrying transient failures
    async fn request_token(&self, request: &TokenRequest) -> GatewayResult<TokenGrant>;

    /// Whether `access_token` is accepted by the broker right now
    async fn probe_token(&self, server_url: &str, access_token: &str) -> GatewayResult<bool>;
}

/// Gate used by the router before handing out an account
#[mockall::automock]
#[async_trait::async_trait]
pub trait TokenValidator: Send + Sync {
    /// Ensure the account holds a usable token, refreshing if needed
    async fn ensure_valid_token(&self, account: &Account) -> GatewayResult<bool>;
}
