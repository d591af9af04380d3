//! Token refresh audit records and their state machine
//!
//! Pending → InProgress → {Success | Failed | Expired | Cancelled}. A Failed
//! record may return to Pending through `retry_refresh` while retries remain.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

use shared::{AccountId, BrokerEnvironment};

use crate::error::{GatewayError, GatewayResult};

pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshStatus {
    Pending,
    InProgress,
    Success,
    Failed,
    Expired,
    Cancelled,
}

impl RefreshStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RefreshStatus::Pending | RefreshStatus::InProgress)
    }
}

impl fmt::Display for RefreshStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RefreshStatus::Pending => "pending",
            RefreshStatus::InProgress => "in_progress",
            RefreshStatus::Success => "success",
            RefreshStatus::Failed => "failed",
            RefreshStatus::Expired => "expired",
            RefreshStatus::Cancelled => "cancelled",
        };
        write!(f, "{name}")
    }
}

/// What caused a refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshTrigger {
    Scheduled,
    Manual,
    OnDemand,
    ExpirySoon,
    Expired,
    Error,
}

/// SHA-256 hex digest used to audit tokens without storing them
pub fn token_fingerprint(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Audit record for one refresh attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRefreshRecord {
    pub id: Uuid,
    pub account_id: AccountId,
    pub status: RefreshStatus,
    pub trigger: RefreshTrigger,
    pub retry_count: u32,
    pub max_retries: u32,
    pub old_token_expires_at: Option<DateTime<Utc>>,
    pub old_token_hash: Option<String>,
    pub new_token_expires_at: Option<DateTime<Utc>>,
    pub new_token_hash: Option<String>,
    pub next_refresh_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub api_response_code: Option<u16>,
    pub api_response_time_ms: Option<u64>,
    pub cancellation_reason: Option<String>,
    pub environment: Option<BrokerEnvironment>,
    pub created_at: DateTime<Utc>,
}

impl TokenRefreshRecord {
    pub fn new(account_id: AccountId, trigger: RefreshTrigger) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_id,
            status: RefreshStatus::Pending,
            trigger,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            old_token_expires_at: None,
            old_token_hash: None,
            new_token_expires_at: None,
            new_token_hash: None,
            next_refresh_at: None,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            error_code: None,
            error_message: None,
            api_response_code: None,
            api_response_time_ms: None,
            cancellation_reason: None,
            environment: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_environment(mut self, environment: BrokerEnvironment) -> Self {
        self.environment = Some(environment);
        self
    }

    /// Snapshot of the token being replaced
    pub fn with_old_token(mut self, token: Option<&str>, expires_at: Option<DateTime<Utc>>) -> Self {
        self.old_token_hash = token.map(token_fingerprint);
        self.old_token_expires_at = expires_at;
        self
    }

    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.next_refresh_at = Some(at);
        self
    }

    pub fn start_refresh(&mut self) -> GatewayResult<()> {
        if self.status != RefreshStatus::Pending {
            return Err(self.invalid("start"));
        }
        self.status = RefreshStatus::InProgress;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Success; the next refresh is due `lead` before the new expiry
    pub fn complete_success(
        &mut self,
        new_token: &str,
        expires_at: DateTime<Utc>,
        lead: chrono::Duration,
        response_code: Option<u16>,
        response_time_ms: Option<u64>,
    ) -> GatewayResult<()> {
        if self.status != RefreshStatus::InProgress {
            return Err(self.invalid("complete"));
        }
        self.finish(RefreshStatus::Success);
        self.new_token_hash = Some(token_fingerprint(new_token));
        self.new_token_expires_at = Some(expires_at);
        self.next_refresh_at = Some(expires_at - lead);
        self.api_response_code = response_code;
        self.api_response_time_ms = response_time_ms;
        Ok(())
    }

    pub fn complete_failure(
        &mut self,
        error_code: impl Into<String>,
        error_message: impl Into<String>,
        response_code: Option<u16>,
    ) -> GatewayResult<()> {
        if !matches!(self.status, RefreshStatus::Pending | RefreshStatus::InProgress) {
            return Err(self.invalid("fail"));
        }
        self.finish(RefreshStatus::Failed);
        self.error_code = Some(error_code.into());
        self.error_message = Some(error_message.into());
        self.api_response_code = response_code;
        Ok(())
    }

    pub fn cancel_refresh(&mut self, reason: impl Into<String>) -> GatewayResult<()> {
        if self.status.is_terminal() {
            return Err(self.invalid("cancel"));
        }
        self.finish(RefreshStatus::Cancelled);
        self.cancellation_reason = Some(reason.into());
        Ok(())
    }

    pub fn mark_expired(&mut self) -> GatewayResult<()> {
        if self.status.is_terminal() {
            return Err(self.invalid("expire"));
        }
        self.finish(RefreshStatus::Expired);
        Ok(())
    }

    pub fn can_retry(&self) -> bool {
        self.status == RefreshStatus::Failed && self.retry_count < self.max_retries
    }

    /// Back to Pending with timing and error fields cleared
    pub fn retry_refresh(&mut self) -> GatewayResult<()> {
        if !self.can_retry() {
            return Err(self.invalid("retry"));
        }
        self.retry_count += 1;
        self.status = RefreshStatus::Pending;
        self.started_at = None;
        self.completed_at = None;
        self.duration_ms = None;
        self.error_code = None;
        self.error_message = None;
        Ok(())
    }

    fn finish(&mut self, status: RefreshStatus) {
        let now = Utc::now();
        self.status = status;
        self.completed_at = Some(now);
        if let Some(started) = self.started_at {
            self.duration_ms = Some((now - started).num_milliseconds().max(0) as u64);
        }
    }

    fn invalid(&self, action: &str) -> GatewayError {
        GatewayError::InvalidTransition {
            state: self.status.to_string(),
            action: action.to_string(),
        }
    }
}
