//! Trait definitions with mockall annotations for testing

use serde_json::Value;

use crate::error::WorkerResult;

/// A live, authenticated connection to the broker for one account
///
/// Exactly one session exists per worker process; the broker client it wraps
/// cannot be shared across accounts inside a single process.
#[mockall::automock]
#[async_trait::async_trait]
pub trait BrokerSession: Send + Sync {
    /// Establish the session. Called once before the worker reports ready.
    async fn open(&self) -> WorkerResult<()>;

    /// Invoke a broker operation with already-validated parameters
    async fn call(&self, operation: &str, params: Value) -> WorkerResult<Value>;
}
