//! Account fixtures and canned broker responses

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Value};

use gateway::types::EncryptedCredentials;
use gateway::{Account, AccountType, MarketPermission};
use shared::BrokerEnvironment;

/// Standard test data and fixtures
pub struct TestFixtures;

impl TestFixtures {
    pub const CLIENT_ID: &'static str = "client-id";
    pub const PRIVATE_KEY: &'static str = "private-key";
    pub const ACCESS_TOKEN: &'static str = "access-token";
    pub const REFRESH_TOKEN: &'static str = "stored-refresh";
    pub const NEW_ACCESS_TOKEN: &'static str = "new-access";
    pub const TOKEN_PATH: &'static str = "/oauth2/token";

    /// Active production account whose token is good for two hours
    pub fn account(name: &str) -> Account {
        let mut account = Account::new(
            name,
            format!("U{name}"),
            BrokerEnvironment::Production,
            AccountType::Standard,
            EncryptedCredentials {
                client_id: Self::CLIENT_ID.to_string(),
                private_key: Self::PRIVATE_KEY.to_string(),
                access_token: Some(Self::ACCESS_TOKEN.to_string()),
                refresh_token: Some(Self::REFRESH_TOKEN.to_string()),
            },
        );
        account.token_expires_at = Some(Utc::now() + ChronoDuration::hours(2));
        account.market_permissions = vec![MarketPermission::UsStock];
        account
    }

    /// Account whose token expired a minute ago
    pub fn expired_account(name: &str) -> Account {
        let mut account = Self::account(name);
        account.token_expires_at = Some(Utc::now() - ChronoDuration::minutes(1));
        account
    }

    pub fn default_trading_account(name: &str) -> Account {
        let mut account = Self::account(name);
        account.is_default_trading = true;
        account
    }

    /// Token endpoint body granting `NEW_ACCESS_TOKEN` for two hours
    pub fn token_body() -> Value {
        json!({
            "access_token": Self::NEW_ACCESS_TOKEN,
            "refresh_token": "new-refresh",
            "expires_in": 7200,
            "token_type": "Bearer"
        })
    }
}
