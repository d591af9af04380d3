//! Credentials a worker needs to open its broker session
//!
//! The gateway decrypts these and passes them to the child in a single
//! environment variable; workers never read the account store.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::{SharedError, SharedResult};
use crate::types::{AccountId, BrokerEnvironment};

/// Environment variable carrying the JSON-encoded `SessionCredentials`
pub const SESSION_ENV_VAR: &str = "BROKER_SESSION";

#[derive(Clone, Serialize, Deserialize)]
pub struct SessionCredentials {
    pub account_id: AccountId,
    pub account_number: String,
    pub environment: BrokerEnvironment,
    pub server_url: String,
    pub client_id: String,
    pub private_key: String,
    pub access_token: Option<String>,
}

impl SessionCredentials {
    /// Encode for `SESSION_ENV_VAR`
    pub fn to_env_value(&self) -> SharedResult<String> {
        serde_json::to_string(self).map_err(|e| SharedError::Encode {
            what: "session credentials",
            message: e.to_string(),
        })
    }

    pub fn from_env_value(value: &str) -> SharedResult<Self> {
        serde_json::from_str(value).map_err(|e| SharedError::Decode {
            what: "session credentials",
            message: e.to_string(),
        })
    }

    /// Read from `SESSION_ENV_VAR` in the current process environment
    pub fn from_env() -> SharedResult<Self> {
        let value = std::env::var(SESSION_ENV_VAR).map_err(|_| SharedError::MissingSession { name: SESSION_ENV_VAR })?;
        Self::from_env_value(&value)
    }
}

impl fmt::Debug for SessionCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCredentials")
            .field("account_id", &self.account_id)
            .field("account_number", &self.account_number)
            .field("environment", &self.environment)
            .field("server_url", &self.server_url)
            .field("client_id", &self.client_id)
            .field("private_key", &"<redacted>")
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}
