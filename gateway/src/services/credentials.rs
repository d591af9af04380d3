//! Credential lifecycle: single-flight token refresh with an audit trail
//!
//! Every refresh that reaches the broker leaves a `TokenRefreshRecord`.
//! Concurrent refreshes for one account share a single round trip and
//! observe the same outcome.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use uuid::Uuid;

use shared::{process_debug, process_error, process_info, process_warn, AccountId, ProcessRole};

use crate::config::CredentialConfig;
use crate::core::refresh::{RefreshStatus, RefreshTrigger, TokenRefreshRecord};
use crate::error::{GatewayError, GatewayResult};
use crate::traits::{
    AccountStore, CredentialCipher, RefreshRecordStore, TokenEndpoint, TokenGrant, TokenGrantKind, TokenRequest,
    TokenValidator,
};
use crate::types::{chrono_duration, Account, AccountFilter, TokenUpdate};

/// Result of a refresh request that did not fail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshOutcome {
    pub account_id: AccountId,
    /// False when the current token was still good and nothing was sent
    pub refreshed: bool,
    pub record_id: Option<Uuid>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Outcome of a remote token check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenValidation {
    pub valid: bool,
    pub reason: Option<String>,
}

impl TokenValidation {
    fn invalid(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkRefreshSummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub errors: HashMap<AccountId, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshStatistics {
    pub total_refreshes: usize,
    pub successful_refreshes: usize,
    pub failed_refreshes: usize,
    /// Percentage, two decimals
    pub success_rate: f64,
    pub average_duration_ms: f64,
    pub triggers: HashMap<RefreshTrigger, usize>,
    pub period_days: u32,
}

type SharedOutcome = Result<RefreshOutcome, Arc<GatewayError>>;
type InFlight = std::sync::Mutex<HashMap<AccountId, watch::Receiver<Option<SharedOutcome>>>>;

/// Removes the in-flight entry even if the leading refresh is cancelled
struct FlightGuard<'a> {
    in_flight: &'a InFlight,
    account_id: AccountId,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut map) = self.in_flight.lock() {
            map.remove(&self.account_id);
        }
    }
}

enum Flight {
    Leader(watch::Sender<Option<SharedOutcome>>),
    Follower(watch::Receiver<Option<SharedOutcome>>),
}

/// Rebuild an error for callers that joined someone else's refresh
fn replay(error: &GatewayError) -> GatewayError {
    match error {
        GatewayError::TokenRateLimit { retry_after_secs } => GatewayError::TokenRateLimit {
            retry_after_secs: *retry_after_secs,
        },
        GatewayError::AccountNotFound { account_id } => GatewayError::AccountNotFound {
            account_id: *account_id,
        },
        other => GatewayError::TokenRefresh {
            status: other.http_status(),
            message: other.to_string(),
        },
    }
}

struct Scheduler {
    handle: JoinHandle<()>,
    stop: watch::Sender<bool>,
}

pub struct CredentialManager<E: TokenEndpoint> {
    accounts: Arc<dyn AccountStore>,
    records: Arc<dyn RefreshRecordStore>,
    cipher: Arc<dyn CredentialCipher>,
    endpoint: Arc<E>,
    config: CredentialConfig,
    in_flight: InFlight,
    scheduler: Mutex<Option<Scheduler>>,
}

impl<E: TokenEndpoint + 'static> CredentialManager<E> {
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        records: Arc<dyn RefreshRecordStore>,
        cipher: Arc<dyn CredentialCipher>,
        endpoint: Arc<E>,
    ) -> Self {
        Self {
            accounts,
            records,
            cipher,
            endpoint,
            config: CredentialConfig::default(),
            in_flight: std::sync::Mutex::new(HashMap::new()),
            scheduler: Mutex::new(None),
        }
    }

    pub fn with_config(mut self, config: CredentialConfig) -> Self {
        self.config = config;
        self
    }

    /// Refresh the account's token unless it is valid and not expiring soon
    pub async fn refresh_token(
        &self,
        account_id: AccountId,
        trigger: RefreshTrigger,
        force: bool,
    ) -> GatewayResult<RefreshOutcome> {
        self.single_flight(account_id, self.perform_refresh(account_id, trigger, force))
            .await
    }

    /// Run `work` unless a refresh for the account is already running, in
    /// which case wait for and share that one's outcome
    async fn single_flight<F>(&self, account_id: AccountId, work: F) -> GatewayResult<RefreshOutcome>
    where
        F: Future<Output = GatewayResult<RefreshOutcome>>,
    {
        let flight = {
            let mut map = self
                .in_flight
                .lock()
                .map_err(|_| GatewayError::communication("refresh registry poisoned"))?;
            match map.get(&account_id) {
                Some(rx) => Flight::Follower(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    map.insert(account_id, rx);
                    Flight::Leader(tx)
                }
            }
        };

        match flight {
            Flight::Follower(mut rx) => loop {
                if let Some(outcome) = rx.borrow().clone() {
                    process_debug!(ProcessRole::current(), "Joined in-flight refresh for {}", account_id.short());
                    return outcome.map_err(|e| replay(&e));
                }
                if rx.changed().await.is_err() {
                    return Err(GatewayError::TokenRefresh {
                        status: None,
                        message: "in-flight refresh was abandoned".to_string(),
                    });
                }
            },
            Flight::Leader(tx) => {
                let _guard = FlightGuard {
                    in_flight: &self.in_flight,
                    account_id,
                };
                match work.await {
                    Ok(outcome) => {
                        let _ = tx.send(Some(Ok(outcome.clone())));
                        Ok(outcome)
                    }
                    Err(e) => {
                        let shared = Arc::new(replay(&e));
                        let _ = tx.send(Some(Err(shared)));
                        Err(e)
                    }
                }
            }
        }
    }

    async fn perform_refresh(
        &self,
        account_id: AccountId,
        trigger: RefreshTrigger,
        force: bool,
    ) -> GatewayResult<RefreshOutcome> {
        let account = self.load_account(account_id).await?;
        let now = Utc::now();
        if !force
            && account.has_valid_token(now)
            && !account.needs_token_refresh(now, chrono_duration(self.config.refresh_threshold))
        {
            return Ok(RefreshOutcome {
                account_id,
                refreshed: false,
                record_id: None,
                expires_at: account.token_expires_at,
            });
        }

        let old_token = self.decrypt_optional(account.credentials.access_token.as_deref())?;
        let record = TokenRefreshRecord::new(account_id, trigger)
            .with_max_retries(self.config.max_retries)
            .with_environment(account.environment)
            .with_old_token(old_token.as_deref(), account.token_expires_at);
        self.records.insert_record(record.clone()).await?;

        self.run_record(&account, record).await
    }

    /// Drive a Pending record through one broker exchange
    async fn run_record(&self, account: &Account, mut record: TokenRefreshRecord) -> GatewayResult<RefreshOutcome> {
        record.start_refresh()?;
        self.records.update_record(record.clone()).await?;

        match self.exchange(account).await {
            Ok((grant, expires_at)) => {
                record.complete_success(
                    &grant.access_token,
                    expires_at,
                    chrono_duration(self.config.refresh_threshold),
                    Some(grant.status_code),
                    Some(grant.response_time_ms),
                )?;
                self.records.update_record(record.clone()).await?;
                process_info!(
                    ProcessRole::current(),
                    "🔑 Refreshed token for {} (expires {})",
                    account.name,
                    expires_at
                );
                Ok(RefreshOutcome {
                    account_id: account.id,
                    refreshed: true,
                    record_id: Some(record.id),
                    expires_at: Some(expires_at),
                })
            }
            Err(e) => {
                record.complete_failure(e.code(), e.to_string(), e.http_status())?;
                self.records.update_record(record).await?;
                self.accounts.increment_error_count(account.id, e.to_string()).await?;
                process_error!(
                    ProcessRole::current(),
                    "❌ Token refresh for {} failed: {}",
                    account.name,
                    e
                );
                Err(e)
            }
        }
    }

    /// Token round trip plus persistence of the new material
    async fn exchange(&self, account: &Account) -> GatewayResult<(TokenGrant, DateTime<Utc>)> {
        let client_id = account.credentials.client_id.clone();
        let grant = match account.credentials.refresh_token.as_deref() {
            Some(encrypted) => TokenGrantKind::RefreshToken {
                refresh_token: self.cipher.decrypt(encrypted)?,
                client_id,
            },
            None => TokenGrantKind::ClientCredentials {
                client_id,
                client_secret: self.cipher.decrypt(&account.credentials.private_key)?,
            },
        };
        let request = TokenRequest {
            server_url: self.server_url(account),
            grant,
        };

        let grant = self.endpoint.request_token(&request).await?;
        let lifetime = grant.expires_in.unwrap_or(self.config.default_expires_in.as_secs());
        let expires_at = Utc::now() + chrono::Duration::seconds(lifetime.min(i64::MAX as u64) as i64);

        let update = TokenUpdate {
            access_token: self.cipher.encrypt(&grant.access_token)?,
            refresh_token: grant
                .refresh_token
                .as_deref()
                .map(|token| self.cipher.encrypt(token))
                .transpose()?,
            expires_at,
        };
        self.accounts.update_tokens(account.id, update).await?;
        self.accounts.reset_error_count(account.id).await?;
        Ok((grant, expires_at))
    }

    /// Check the token with the broker without refreshing it
    pub async fn validate_token(&self, account_id: AccountId) -> GatewayResult<TokenValidation> {
        let account = self.load_account(account_id).await?;
        let Some(encrypted) = account.credentials.access_token.as_deref() else {
            return Ok(TokenValidation::invalid("No access token available"));
        };
        if !account.has_valid_token(Utc::now()) {
            return Ok(TokenValidation::invalid("Token has expired"));
        }

        let token = self.cipher.decrypt(encrypted)?;
        match self.endpoint.probe_token(&self.server_url(&account), &token).await {
            Ok(true) => Ok(TokenValidation {
                valid: true,
                reason: None,
            }),
            Ok(false) => Ok(TokenValidation::invalid("Token is invalid or expired")),
            Err(e) => Ok(TokenValidation::invalid(e.to_string())),
        }
    }

    /// Refresh every active account whose token is missing or expiring,
    /// at most `bulk_concurrency` at a time
    pub async fn refresh_expired_tokens(&self) -> GatewayResult<BulkRefreshSummary> {
        let now = Utc::now();
        let threshold = chrono_duration(self.config.refresh_threshold);
        let due: Vec<Account> = self
            .accounts
            .list_accounts(AccountFilter::active())
            .await?
            .into_iter()
            .filter(|a| a.credentials.access_token.is_none() || a.needs_token_refresh(now, threshold))
            .collect();

        if due.is_empty() {
            process_debug!(ProcessRole::current(), "No accounts need token refresh");
            return Ok(BulkRefreshSummary::default());
        }
        process_info!(ProcessRole::current(), "🔑 {} accounts need token refresh", due.len());

        let permits = Arc::new(Semaphore::new(self.config.bulk_concurrency.max(1)));
        let results = join_all(due.iter().map(|account| {
            let permits = Arc::clone(&permits);
            async move {
                let _permit = permits.acquire_owned().await;
                (account.id, self.refresh_token(account.id, RefreshTrigger::Scheduled, false).await)
            }
        }))
        .await;

        let mut summary = BulkRefreshSummary {
            attempted: results.len(),
            ..BulkRefreshSummary::default()
        };
        for (account_id, result) in results {
            match result {
                Ok(_) => summary.succeeded += 1,
                Err(e) => {
                    summary.failed += 1;
                    summary.errors.insert(account_id, e.to_string());
                }
            }
        }
        process_info!(
            ProcessRole::current(),
            "🔑 Token refresh completed: {} successful, {} failed",
            summary.succeeded,
            summary.failed
        );
        Ok(summary)
    }

    /// Re-run a Failed record if it still has retries left
    pub async fn retry_failed_refresh(&self, record_id: Uuid) -> GatewayResult<RefreshOutcome> {
        let record = self
            .records
            .get_record(record_id)
            .await?
            .ok_or(GatewayError::RecordNotFound { record_id })?;
        if !record.can_retry() {
            return Err(GatewayError::InvalidTransition {
                state: record.status.to_string(),
                action: "retry".to_string(),
            });
        }

        let account_id = record.account_id;
        self.single_flight(account_id, async move {
            let mut record = record;
            record.retry_refresh()?;
            self.records.update_record(record.clone()).await?;
            let account = self.load_account(account_id).await?;
            self.run_record(&account, record).await
        })
        .await
    }

    /// Record a Pending scheduled refresh, by default one refresh threshold
    /// before the current expiry
    pub async fn schedule_token_refresh(
        &self,
        account_id: AccountId,
        at: Option<DateTime<Utc>>,
    ) -> GatewayResult<TokenRefreshRecord> {
        let account = self.load_account(account_id).await?;
        let lead = chrono_duration(self.config.refresh_threshold);
        let at = at.unwrap_or_else(|| match account.token_expires_at {
            Some(expires_at) => expires_at - lead,
            None => Utc::now() + lead,
        });

        let old_token = self.decrypt_optional(account.credentials.access_token.as_deref())?;
        let record = TokenRefreshRecord::new(account_id, RefreshTrigger::Scheduled)
            .with_max_retries(self.config.max_retries)
            .with_environment(account.environment)
            .with_old_token(old_token.as_deref(), account.token_expires_at)
            .scheduled_for(at);
        self.records.insert_record(record.clone()).await?;

        process_info!(ProcessRole::current(), "📅 Scheduled token refresh for {} at {}", account.name, at);
        Ok(record)
    }

    /// Run Pending scheduled records that are due, returning how many ran
    pub async fn run_scheduled_refreshes(&self) -> GatewayResult<usize> {
        let now = Utc::now();
        let due: Vec<TokenRefreshRecord> = self
            .records
            .list_records(None, None, None)
            .await?
            .into_iter()
            .filter(|r| r.status == RefreshStatus::Pending && r.trigger == RefreshTrigger::Scheduled)
            .filter(|r| r.next_refresh_at.is_some_and(|at| at <= now))
            .collect();

        let mut ran = 0;
        for record in due {
            let account_id = record.account_id;
            let result = self
                .single_flight(account_id, async move {
                    let account = self.load_account(account_id).await?;
                    if !account.is_active() {
                        let mut record = record;
                        record.cancel_refresh(format!("account is {}", account.status))?;
                        self.records.update_record(record).await?;
                        return Ok(RefreshOutcome {
                            account_id,
                            refreshed: false,
                            record_id: None,
                            expires_at: account.token_expires_at,
                        });
                    }
                    self.run_record(&account, record).await
                })
                .await;
            match result {
                Ok(outcome) if outcome.refreshed => ran += 1,
                Ok(_) => {}
                Err(e) => process_warn!(ProcessRole::current(), "⚠️ Scheduled refresh for {} failed: {}", account_id.short(), e),
            }
        }
        Ok(ran)
    }

    /// Newest first
    pub async fn get_token_status_history(
        &self,
        account_id: Option<AccountId>,
        limit: usize,
    ) -> GatewayResult<Vec<TokenRefreshRecord>> {
        self.records.list_records(account_id, None, Some(limit)).await
    }

    pub async fn get_refresh_statistics(
        &self,
        account_id: Option<AccountId>,
        days: u32,
    ) -> GatewayResult<RefreshStatistics> {
        let since = Utc::now() - chrono::Duration::days(i64::from(days));
        let records = self.records.list_records(account_id, Some(since), None).await?;

        let total = records.len();
        let successful = records.iter().filter(|r| r.status == RefreshStatus::Success).count();
        let durations: Vec<u64> = records.iter().filter_map(|r| r.duration_ms).collect();
        let mut triggers = HashMap::new();
        for record in &records {
            *triggers.entry(record.trigger).or_insert(0) += 1;
        }

        let success_rate = if total > 0 {
            (successful as f64 / total as f64 * 10_000.0).round() / 100.0
        } else {
            0.0
        };
        let average_duration_ms = if durations.is_empty() {
            0.0
        } else {
            durations.iter().sum::<u64>() as f64 / durations.len() as f64
        };

        Ok(RefreshStatistics {
            total_refreshes: total,
            successful_refreshes: successful,
            failed_refreshes: total - successful,
            success_rate,
            average_duration_ms,
            triggers,
            period_days: days,
        })
    }

    /// One scheduler pass
    pub async fn run_scheduler_tick(&self) -> GatewayResult<()> {
        self.run_scheduled_refreshes().await?;
        self.refresh_expired_tokens().await?;
        Ok(())
    }

    /// Start the background refresh scheduler if enabled
    pub async fn start(self: &Arc<Self>) {
        if !self.config.scheduler_enabled {
            return;
        }
        let mut scheduler = self.scheduler.lock().await;
        if scheduler.is_some() {
            return;
        }

        let (stop, mut stopped) = watch::channel(false);
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                let pause = match manager.run_scheduler_tick().await {
                    Ok(()) => manager.config.scheduler_interval,
                    Err(e) => {
                        process_error!(ProcessRole::current(), "❌ Token scheduler pass failed: {}", e);
                        manager.config.scheduler_error_backoff
                    }
                };
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    _ = stopped.changed() => break,
                }
            }
        });

        *scheduler = Some(Scheduler { handle, stop });
        process_info!(
            ProcessRole::current(),
            "📅 Token refresh scheduler started (every {:?})",
            self.config.scheduler_interval
        );
    }

    pub async fn stop(&self) {
        if let Some(scheduler) = self.scheduler.lock().await.take() {
            let _ = scheduler.stop.send(true);
            let _ = scheduler.handle.await;
        }
    }

    async fn load_account(&self, account_id: AccountId) -> GatewayResult<Account> {
        self.accounts
            .get_account(account_id)
            .await?
            .ok_or(GatewayError::AccountNotFound { account_id })
    }

    fn decrypt_optional(&self, value: Option<&str>) -> GatewayResult<Option<String>> {
        value.map(|v| self.cipher.decrypt(v)).transpose()
    }

    fn server_url(&self, account: &Account) -> String {
        account
            .server_url
            .clone()
            .unwrap_or_else(|| self.config.server_url(account.environment).to_string())
    }
}

#[async_trait]
impl<E: TokenEndpoint + 'static> TokenValidator for CredentialManager<E> {
    async fn ensure_valid_token(&self, account: &Account) -> GatewayResult<bool> {
        let now = Utc::now();
        let threshold = chrono_duration(self.config.refresh_threshold);
        if account.has_valid_token(now) && !account.needs_token_refresh(now, threshold) {
            return Ok(true);
        }

        let trigger = if account.credentials.access_token.is_none() {
            RefreshTrigger::OnDemand
        } else if account.has_valid_token(now) {
            RefreshTrigger::ExpirySoon
        } else {
            RefreshTrigger::Expired
        };
        match self.refresh_token(account.id, trigger, false).await {
            Ok(_) => Ok(true),
            Err(e) => {
                process_warn!(
                    ProcessRole::current(),
                    "⚠️ No usable token for {}: {}",
                    account.name,
                    e
                );
                Ok(false)
            }
        }
    }
}
