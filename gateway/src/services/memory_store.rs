//! In-memory account and refresh-record store
//!
//! Development and test backing for the store seams. Can be seeded from a
//! JSON file holding an array of accounts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;
use tokio::sync::RwLock;
use uuid::Uuid;

use shared::{process_info, process_warn, AccountId, ProcessRole};

use crate::core::refresh::TokenRefreshRecord;
use crate::error::{GatewayError, GatewayResult};
use crate::traits::{AccountStore, RefreshRecordStore};
use crate::types::{Account, AccountFilter, DefaultRole, TokenUpdate};

#[derive(Default)]
pub struct InMemoryStore {
    accounts: RwLock<Vec<Account>>,
    records: RwLock<Vec<TokenRefreshRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with accounts; only the first holder of each default flag keeps it
    pub fn from_accounts(accounts: Vec<Account>) -> Self {
        let mut accounts = accounts;
        let (mut trading_seen, mut data_seen) = (false, false);
        for account in accounts.iter_mut() {
            if account.is_default_trading {
                if trading_seen {
                    process_warn!(ProcessRole::current(), "⚠️ Dropping duplicate default trading flag on {}", account.name);
                    account.is_default_trading = false;
                }
                trading_seen = true;
            }
            if account.is_default_data {
                if data_seen {
                    process_warn!(ProcessRole::current(), "⚠️ Dropping duplicate default data flag on {}", account.name);
                    account.is_default_data = false;
                }
                data_seen = true;
            }
        }

        Self {
            accounts: RwLock::new(accounts),
            records: RwLock::new(Vec::new()),
        }
    }

    /// Load a JSON array of accounts
    pub async fn load_from_file(path: impl AsRef<Path>) -> GatewayResult<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await?;
        let accounts: Vec<Account> = serde_json::from_str(&raw)?;
        process_info!(
            ProcessRole::current(),
            "📂 Loaded {} accounts from {}",
            accounts.len(),
            path.display()
        );
        Ok(Self::from_accounts(accounts))
    }

    /// Insert or replace by id
    pub async fn upsert_account(&self, account: Account) {
        let mut accounts = self.accounts.write().await;
        match accounts.iter_mut().find(|a| a.id == account.id) {
            Some(existing) => *existing = account,
            None => accounts.push(account),
        }
    }

    pub async fn record_count(&self) -> usize {
        self.records.read().await.len()
    }

    async fn with_account<T>(&self, account_id: AccountId, f: impl FnOnce(&mut Account) -> T) -> GatewayResult<T> {
        let mut accounts = self.accounts.write().await;
        let account = accounts
            .iter_mut()
            .find(|a| a.id == account_id)
            .ok_or(GatewayError::AccountNotFound { account_id })?;
        Ok(f(account))
    }
}

#[async_trait]
impl AccountStore for InMemoryStore {
    async fn get_account(&self, account_id: AccountId) -> GatewayResult<Option<Account>> {
        Ok(self.accounts.read().await.iter().find(|a| a.id == account_id).cloned())
    }

    async fn list_accounts(&self, filter: AccountFilter) -> GatewayResult<Vec<Account>> {
        Ok(self
            .accounts
            .read()
            .await
            .iter()
            .filter(|a| filter.matches(a))
            .cloned()
            .collect())
    }

    async fn get_default_account(&self, role: DefaultRole) -> GatewayResult<Option<Account>> {
        Ok(self
            .accounts
            .read()
            .await
            .iter()
            .find(|a| match role {
                DefaultRole::Trading => a.is_default_trading,
                DefaultRole::Data => a.is_default_data,
            })
            .cloned())
    }

    async fn set_default_account(&self, role: DefaultRole, account_id: AccountId) -> GatewayResult<()> {
        let mut accounts = self.accounts.write().await;
        if !accounts.iter().any(|a| a.id == account_id) {
            return Err(GatewayError::AccountNotFound { account_id });
        }
        for account in accounts.iter_mut() {
            let flag = match role {
                DefaultRole::Trading => &mut account.is_default_trading,
                DefaultRole::Data => &mut account.is_default_data,
            };
            *flag = account.id == account_id;
        }
        Ok(())
    }

    async fn update_tokens(&self, account_id: AccountId, update: TokenUpdate) -> GatewayResult<()> {
        self.with_account(account_id, |account| {
            account.credentials.access_token = Some(update.access_token);
            if let Some(refresh_token) = update.refresh_token {
                account.credentials.refresh_token = Some(refresh_token);
            }
            account.token_expires_at = Some(update.expires_at);
        })
        .await
    }

    async fn increment_error_count(&self, account_id: AccountId, message: String) -> GatewayResult<()> {
        self.with_account(account_id, |account| {
            account.error_count += 1;
            account.last_error = Some(message);
            account.last_error_at = Some(Utc::now());
        })
        .await
    }

    async fn reset_error_count(&self, account_id: AccountId) -> GatewayResult<()> {
        self.with_account(account_id, |account| {
            account.error_count = 0;
            account.last_error = None;
        })
        .await
    }
}

#[async_trait]
impl RefreshRecordStore for InMemoryStore {
    async fn insert_record(&self, record: TokenRefreshRecord) -> GatewayResult<()> {
        self.records.write().await.push(record);
        Ok(())
    }

    async fn update_record(&self, record: TokenRefreshRecord) -> GatewayResult<()> {
        let mut records = self.records.write().await;
        let existing = records
            .iter_mut()
            .find(|r| r.id == record.id)
            .ok_or(GatewayError::RecordNotFound { record_id: record.id })?;
        *existing = record;
        Ok(())
    }

    async fn get_record(&self, record_id: Uuid) -> GatewayResult<Option<TokenRefreshRecord>> {
        Ok(self.records.read().await.iter().find(|r| r.id == record_id).cloned())
    }

    async fn list_records(
        &self,
        account_id: Option<AccountId>,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> GatewayResult<Vec<TokenRefreshRecord>> {
        let records = self.records.read().await;
        let mut matching: Vec<TokenRefreshRecord> = records
            .iter()
            .filter(|r| account_id.map_or(true, |id| r.account_id == id))
            .filter(|r| since.map_or(true, |t| r.created_at >= t))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = limit {
            matching.truncate(limit);
        }
        Ok(matching)
    }
}
