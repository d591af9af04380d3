//! Service implementations
//!
//! Everything here performs I/O: child processes, framed pipes, HTTP and the
//! account store. Pure bookkeeping lives in `crate::core`.

pub mod account_router;
pub mod cipher;
pub mod coordinator;
pub mod credentials;
pub mod launcher;
pub mod memory_store;
pub mod token_client;
pub mod worker_pool;

#[cfg(test)]
mod tests;

pub use account_router::{AccountAvailability, AccountRouter, RouteRequest, RoutingStatistics};
pub use cipher::PassthroughCipher;
pub use coordinator::{HealthReport, PoolCoordinator, HEALTH_CHECK_METHOD};
pub use credentials::{BulkRefreshSummary, CredentialManager, RefreshOutcome, RefreshStatistics, TokenValidation};
pub use launcher::ProcessLauncher;
pub use memory_store::InMemoryStore;
pub use token_client::HttpTokenEndpoint;
pub use worker_pool::WorkerPool;
