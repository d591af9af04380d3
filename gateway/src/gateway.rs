//! Gateway facade
//!
//! Builds the worker pool, coordinator, credential manager and router once
//! and wires them together: caller → router → coordinator → pool → worker.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

use shared::{logging, process_debug, process_info, process_warn, AccountId, BrokerEnvironment, ProcessRole};

use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::services::account_router::{AccountRouter, RouteRequest};
use crate::services::coordinator::PoolCoordinator;
use crate::services::credentials::CredentialManager;
use crate::services::worker_pool::WorkerPool;
use crate::traits::{AccountStore, CredentialCipher, RefreshRecordStore, TokenEndpoint, TokenValidator, WorkerLauncher};
use crate::types::{Account, AccountFilter, MarketPermission, OperationType};

/// One broker call as submitted by a caller
#[derive(Debug, Clone)]
pub struct GatewayCall {
    pub operation: OperationType,
    /// Dotted worker method, e.g. `trade.place_order`
    pub method: String,
    /// Skip routing and use this account
    pub account_id: Option<AccountId>,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub required_permissions: Vec<MarketPermission>,
    pub environment: Option<BrokerEnvironment>,
    pub timeout: Option<Duration>,
}

impl GatewayCall {
    pub fn new(operation: OperationType, method: impl Into<String>) -> Self {
        Self {
            operation,
            method: method.into(),
            account_id: None,
            args: Vec::new(),
            kwargs: Map::new(),
            required_permissions: Vec::new(),
            environment: None,
            timeout: None,
        }
    }

    pub fn on_account(mut self, account_id: AccountId) -> Self {
        self.account_id = Some(account_id);
        self
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_kwarg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.kwargs.insert(key.into(), value);
        self
    }

    pub fn with_permissions(mut self, permissions: impl IntoIterator<Item = MarketPermission>) -> Self {
        self.required_permissions.extend(permissions);
        self
    }

    pub fn in_environment(mut self, environment: BrokerEnvironment) -> Self {
        self.environment = Some(environment);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Result of a call plus the account that served it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallOutcome {
    pub account_id: AccountId,
    pub account_name: String,
    pub result: Value,
    pub elapsed_ms: f64,
}

/// Multi-account broker gateway
pub struct Gateway<L, E>
where
    L: WorkerLauncher + 'static,
    E: TokenEndpoint + 'static,
{
    store: Arc<dyn AccountStore>,
    pool: Arc<WorkerPool<L>>,
    coordinator: Arc<PoolCoordinator<L>>,
    credentials: Arc<CredentialManager<E>>,
    router: AccountRouter,
}

impl<L, E> Gateway<L, E>
where
    L: WorkerLauncher + 'static,
    E: TokenEndpoint + 'static,
{
    /// Create the gateway with injected seams
    pub fn new(
        config: GatewayConfig,
        store: Arc<dyn AccountStore>,
        records: Arc<dyn RefreshRecordStore>,
        cipher: Arc<dyn CredentialCipher>,
        launcher: Arc<L>,
        endpoint: Arc<E>,
    ) -> Self {
        let pool = Arc::new(WorkerPool::new(launcher).with_config(config.pool));
        let coordinator = Arc::new(PoolCoordinator::with_config(
            Arc::clone(&pool),
            Arc::clone(&store),
            config.coordinator,
        ));
        let credentials = Arc::new(
            CredentialManager::new(Arc::clone(&store), records, cipher, endpoint).with_config(config.credentials),
        );
        let validator: Arc<dyn TokenValidator> = credentials.clone();
        let router = AccountRouter::with_config(Arc::clone(&store), validator, config.router);

        Self {
            store,
            pool,
            coordinator,
            credentials,
            router,
        }
    }

    pub fn pool(&self) -> &Arc<WorkerPool<L>> {
        &self.pool
    }

    pub fn coordinator(&self) -> &Arc<PoolCoordinator<L>> {
        &self.coordinator
    }

    pub fn credentials(&self) -> &Arc<CredentialManager<E>> {
        &self.credentials
    }

    pub fn router(&self) -> &AccountRouter {
        &self.router
    }

    /// Start the background loops
    pub async fn start(&self) {
        self.pool.start().await;
        self.coordinator.start().await;
        self.credentials.start().await;
        logging::log_success(ProcessRole::current(), "Gateway started");
    }

    /// Stop the background loops and every worker
    pub async fn shutdown(&self) {
        self.credentials.stop().await;
        self.coordinator.stop().await;
        self.pool.stop().await;
        logging::log_shutdown(ProcessRole::current(), "gateway stopped");
    }

    /// Start workers for every active account; returns how many came up
    pub async fn warm_up(&self) -> GatewayResult<usize> {
        let accounts = self.store.list_accounts(AccountFilter::active()).await?;
        let mut started = 0;
        for account in &accounts {
            match self.pool.get_or_create_process(account.id).await {
                Ok(_) => started += 1,
                Err(e) => process_warn!(ProcessRole::current(), "⚠️ Could not start worker for {}: {}", account.name, e),
            }
        }
        process_info!(
            ProcessRole::current(),
            "🔥 Warmed {}/{} account workers",
            started,
            accounts.len()
        );
        Ok(started)
    }

    /// Route the call (unless pinned), run it and record its latency
    pub async fn execute(&self, call: GatewayCall) -> GatewayResult<CallOutcome> {
        let account = match call.account_id {
            Some(account_id) => self.pinned_account(account_id).await?,
            None => self.route(&call).await?,
        };

        let started = Instant::now();
        let result = self
            .coordinator
            .execute_api_call(account.id, &call.method, call.args, call.kwargs, call.timeout)
            .await?;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.router.record_operation_response_time(account.id, elapsed_ms).await;

        Ok(CallOutcome {
            account_id: account.id,
            account_name: account.name,
            result,
            elapsed_ms,
        })
    }

    async fn route(&self, call: &GatewayCall) -> GatewayResult<Account> {
        let permissions = call.required_permissions.clone();
        if call.operation.is_trading() {
            self.router
                .route_trading_operation(call.operation, permissions, call.environment)
                .await
        } else if call.operation.is_data() {
            self.router
                .route_data_operation(call.operation, permissions, call.environment)
                .await
        } else {
            let mut request = RouteRequest::new(call.operation).with_permissions(permissions);
            request.environment = call.environment;
            self.router.route_operation(&request).await
        }
    }

    async fn pinned_account(&self, account_id: AccountId) -> GatewayResult<Account> {
        let account = self
            .store
            .get_account(account_id)
            .await?
            .ok_or(GatewayError::AccountNotFound { account_id })?;
        if !self.credentials.ensure_valid_token(&account).await? {
            return Err(GatewayError::TokenRefresh {
                status: None,
                message: format!("no usable token for account {}", account.name),
            });
        }
        process_debug!(ProcessRole::current(), "📌 Call pinned to {}", account.name);
        Ok(account)
    }
}
