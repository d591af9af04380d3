//! Core identifiers used throughout the gateway and its worker processes

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use uuid::Uuid;

use crate::errors::SharedError;

/// Role of the current OS process - set once at startup
static PROCESS_ROLE: OnceLock<ProcessRole> = OnceLock::new();

/// Role reported before `init_*` has run (library use, unit tests)
static UNREGISTERED: ProcessRole = ProcessRole::Unregistered;

/// Which component of the system the current OS process is
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessRole {
    /// The supervising gateway (singleton)
    Gateway,
    /// A worker process bound to a single account
    Worker(AccountId),
    /// No role registered yet
    Unregistered,
}

impl ProcessRole {
    /// Register the current process as the gateway
    pub fn init_gateway() -> &'static ProcessRole {
        PROCESS_ROLE.get_or_init(|| ProcessRole::Gateway)
    }

    /// Register the current process as the worker for `account_id`
    pub fn init_worker(account_id: AccountId) -> &'static ProcessRole {
        PROCESS_ROLE.get_or_init(|| ProcessRole::Worker(account_id))
    }

    /// Role of the current process, `Unregistered` until an `init_*` call
    pub fn current() -> &'static ProcessRole {
        PROCESS_ROLE.get().unwrap_or(&UNREGISTERED)
    }

    /// Crate targets whose events this role wants to see
    pub fn filter_targets(&self) -> &'static [&'static str] {
        match self {
            ProcessRole::Gateway => &["gateway", "shared"],
            ProcessRole::Worker(_) => &["worker", "shared"],
            ProcessRole::Unregistered => &["gateway", "worker", "shared"],
        }
    }
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessRole::Gateway => write!(f, "gateway"),
            ProcessRole::Worker(account_id) => write!(f, "worker_{}", account_id.short()),
            ProcessRole::Unregistered => write!(f, "unregistered"),
        }
    }
}

/// Broker account identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId(Uuid);

impl AccountId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn from_string(s: &str) -> Result<Self, SharedError> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| SharedError::InvalidId { input: s.to_string() })
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// First eight hex digits, for log prefixes
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for AccountId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AccountId {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_string(s)
    }
}

/// Identifier of a worker process slot; survives restarts of the OS process behind it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessId(Uuid);

impl ProcessId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_string(s: &str) -> Result<Self, SharedError> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| SharedError::InvalidId { input: s.to_string() })
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ProcessId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Broker environment an account lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BrokerEnvironment {
    Production,
    Sandbox,
}

impl BrokerEnvironment {
    pub fn is_production(&self) -> bool {
        matches!(self, BrokerEnvironment::Production)
    }
}

impl fmt::Display for BrokerEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerEnvironment::Production => write!(f, "production"),
            BrokerEnvironment::Sandbox => write!(f, "sandbox"),
        }
    }
}

impl FromStr for BrokerEnvironment {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "production" | "prod" => Ok(BrokerEnvironment::Production),
            "sandbox" | "paper" => Ok(BrokerEnvironment::Sandbox),
            _ => Err(SharedError::UnknownEnvironment { value: s.to_string() }),
        }
    }
}
