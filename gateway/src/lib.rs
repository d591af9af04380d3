//! Multi-account broker gateway
//!
//! Runs one isolated worker process per broker account, routes calls to a
//! suitable account, watches worker health and keeps OAuth tokens fresh.

pub mod config;
pub mod core;
pub mod error;
pub mod gateway;
pub mod services;
pub mod traits;
pub mod types;

// Re-export commonly used types
pub use config::GatewayConfig;
pub use crate::core::{ProcessRecord, ProcessStatus, RefreshTrigger, RoutingStrategy, TokenRefreshRecord};
pub use error::{GatewayError, GatewayResult};
pub use gateway::{CallOutcome, Gateway, GatewayCall};
pub use traits::{AccountStore, CredentialCipher, RefreshRecordStore, TokenEndpoint, TokenValidator, WorkerLauncher};
pub use types::{Account, AccountFilter, AccountStatus, AccountType, MarketPermission, OperationType};
