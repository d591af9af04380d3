//! Account and operation types owned by the gateway

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use shared::{AccountId, BrokerEnvironment};

use crate::error::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Inactive,
    Suspended,
    PendingVerification,
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AccountStatus::Active => "active",
            AccountStatus::Inactive => "inactive",
            AccountStatus::Suspended => "suspended",
            AccountStatus::PendingVerification => "pending_verification",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    Standard,
    /// Paper trading account
    Paper,
    Prime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketPermission {
    UsStock,
    HkStock,
    CnStock,
    UsOption,
    HkOption,
    Futures,
    Forex,
}

/// Secrets as stored: everything except the client id is ciphertext
#[derive(Clone, Serialize, Deserialize)]
pub struct EncryptedCredentials {
    pub client_id: String,
    pub private_key: String,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

impl fmt::Debug for EncryptedCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedCredentials")
            .field("client_id", &self.client_id)
            .field("has_access_token", &self.access_token.is_some())
            .field("has_refresh_token", &self.refresh_token.is_some())
            .finish()
    }
}

/// A broker account the gateway can route work to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub name: String,
    pub account_number: String,
    pub status: AccountStatus,
    pub environment: BrokerEnvironment,
    pub account_type: AccountType,
    #[serde(default)]
    pub market_permissions: Vec<MarketPermission>,
    pub credentials: EncryptedCredentials,
    /// Overrides the environment's default server
    #[serde(default)]
    pub server_url: Option<String>,
    #[serde(default)]
    pub token_expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub last_error_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_default_trading: bool,
    #[serde(default)]
    pub is_default_data: bool,
}

impl Account {
    pub fn new(
        name: impl Into<String>,
        account_number: impl Into<String>,
        environment: BrokerEnvironment,
        account_type: AccountType,
        credentials: EncryptedCredentials,
    ) -> Self {
        Self {
            id: AccountId::new(),
            name: name.into(),
            account_number: account_number.into(),
            status: AccountStatus::Active,
            environment,
            account_type,
            market_permissions: Vec::new(),
            credentials,
            server_url: None,
            token_expires_at: None,
            error_count: 0,
            last_error: None,
            last_error_at: None,
            is_default_trading: false,
            is_default_data: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }

    /// Token present and not yet expired
    pub fn has_valid_token(&self, now: DateTime<Utc>) -> bool {
        match (&self.credentials.access_token, self.token_expires_at) {
            (Some(_), Some(expires_at)) => expires_at > now,
            _ => false,
        }
    }

    /// No known expiry, or expiring within `threshold`
    pub fn needs_token_refresh(&self, now: DateTime<Utc>, threshold: chrono::Duration) -> bool {
        match self.token_expires_at {
            Some(expires_at) => expires_at - now < threshold,
            None => true,
        }
    }

    pub fn has_permissions(&self, required: &[MarketPermission]) -> bool {
        required.iter().all(|p| self.market_permissions.contains(p))
    }

    /// Trading needs a production account or a paper account
    pub fn supports_trading(&self) -> bool {
        self.environment.is_production() || self.account_type == AccountType::Paper
    }
}

/// Store query filter; `None` fields match anything
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountFilter {
    pub status: Option<AccountStatus>,
    pub environment: Option<BrokerEnvironment>,
    pub account_type: Option<AccountType>,
}

impl AccountFilter {
    pub fn active() -> Self {
        Self {
            status: Some(AccountStatus::Active),
            ..Self::default()
        }
    }

    pub fn matches(&self, account: &Account) -> bool {
        self.status.map_or(true, |s| account.status == s)
            && self.environment.map_or(true, |e| account.environment == e)
            && self.account_type.map_or(true, |t| account.account_type == t)
    }
}

/// Which default flag an account can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DefaultRole {
    Trading,
    Data,
}

/// New token material, already encrypted
#[derive(Debug, Clone)]
pub struct TokenUpdate {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// Kind of work a request performs, used for routing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    // Data operations
    MarketData,
    Quote,
    HistoricalData,
    Fundamentals,
    OptionsChain,
    // Trading operations
    PlaceOrder,
    ModifyOrder,
    CancelOrder,
    // Account operations
    AccountInfo,
    Positions,
    Orders,
    Transactions,
    // Analysis operations
    PortfolioAnalysis,
    RiskAnalysis,
}

impl OperationType {
    pub const ALL: [OperationType; 14] = [
        OperationType::MarketData,
        OperationType::Quote,
        OperationType::HistoricalData,
        OperationType::Fundamentals,
        OperationType::OptionsChain,
        OperationType::PlaceOrder,
        OperationType::ModifyOrder,
        OperationType::CancelOrder,
        OperationType::AccountInfo,
        OperationType::Positions,
        OperationType::Orders,
        OperationType::Transactions,
        OperationType::PortfolioAnalysis,
        OperationType::RiskAnalysis,
    ];

    pub fn is_trading(&self) -> bool {
        matches!(
            self,
            OperationType::PlaceOrder | OperationType::ModifyOrder | OperationType::CancelOrder
        )
    }

    pub fn is_data(&self) -> bool {
        matches!(
            self,
            OperationType::MarketData
                | OperationType::Quote
                | OperationType::HistoricalData
                | OperationType::Fundamentals
                | OperationType::OptionsChain
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::MarketData => "market_data",
            OperationType::Quote => "quote",
            OperationType::HistoricalData => "historical_data",
            OperationType::Fundamentals => "fundamentals",
            OperationType::OptionsChain => "options_chain",
            OperationType::PlaceOrder => "place_order",
            OperationType::ModifyOrder => "modify_order",
            OperationType::CancelOrder => "cancel_order",
            OperationType::AccountInfo => "account_info",
            OperationType::Positions => "positions",
            OperationType::Orders => "orders",
            OperationType::Transactions => "transactions",
            OperationType::PortfolioAnalysis => "portfolio_analysis",
            OperationType::RiskAnalysis => "risk_analysis",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OperationType::ALL
            .iter()
            .copied()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| GatewayError::OperationNotSupported {
                operation: s.to_string(),
            })
    }
}

/// Convert a configuration duration for date arithmetic
pub fn chrono_duration(duration: std::time::Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(duration.as_millis().min(i64::MAX as u128) as i64)
}
