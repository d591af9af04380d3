//! Account router: picks the account that services an unpinned request

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

use shared::{process_debug, process_info, process_warn, AccountId, BrokerEnvironment, ProcessRole};

use crate::config::RouterConfig;
use crate::core::balancer::{Balancer, RoutingStrategy};
use crate::error::{GatewayError, GatewayResult};
use crate::traits::{AccountStore, TokenValidator};
use crate::types::{Account, AccountFilter, AccountStatus, AccountType, DefaultRole, MarketPermission, OperationType};

/// What a caller needs from the account it is routed to
#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub operation: OperationType,
    pub required_permissions: Vec<MarketPermission>,
    pub environment: Option<BrokerEnvironment>,
    pub account_type: Option<AccountType>,
    pub strategy: RoutingStrategy,
    pub exclude: HashSet<AccountId>,
}

impl RouteRequest {
    pub fn new(operation: OperationType) -> Self {
        Self {
            operation,
            required_permissions: Vec::new(),
            environment: None,
            account_type: None,
            strategy: RoutingStrategy::default(),
            exclude: HashSet::new(),
        }
    }

    pub fn with_permissions(mut self, permissions: impl IntoIterator<Item = MarketPermission>) -> Self {
        self.required_permissions.extend(permissions);
        self
    }

    pub fn with_environment(mut self, environment: BrokerEnvironment) -> Self {
        self.environment = Some(environment);
        self
    }

    pub fn with_account_type(mut self, account_type: AccountType) -> Self {
        self.account_type = Some(account_type);
        self
    }

    pub fn with_strategy(mut self, strategy: RoutingStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn excluding(mut self, account_ids: impl IntoIterator<Item = AccountId>) -> Self {
        self.exclude.extend(account_ids);
        self
    }
}

/// Why an account can or cannot take work right now
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountAvailability {
    pub account_id: AccountId,
    pub available: bool,
    pub reasons: Vec<String>,
    pub error_count: u32,
    pub token_valid: bool,
    pub usage_count: u64,
    pub average_latency_ms: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingStatistics {
    pub total_routed: u64,
    pub usage_distribution: HashMap<AccountId, u64>,
    pub average_latencies: HashMap<AccountId, f64>,
}

pub struct AccountRouter {
    store: Arc<dyn AccountStore>,
    validator: Arc<dyn TokenValidator>,
    config: RouterConfig,
    balancer: Mutex<Balancer>,
}

impl AccountRouter {
    pub fn new(store: Arc<dyn AccountStore>, validator: Arc<dyn TokenValidator>) -> Self {
        Self::with_config(store, validator, RouterConfig::default())
    }

    pub fn with_config(store: Arc<dyn AccountStore>, validator: Arc<dyn TokenValidator>, config: RouterConfig) -> Self {
        let balancer = Balancer::new(config.latency_window);
        Self {
            store,
            validator,
            config,
            balancer: Mutex::new(balancer),
        }
    }

    /// Select an eligible account whose token is usable
    pub async fn route_operation(&self, request: &RouteRequest) -> GatewayResult<Account> {
        let mut candidates = self.eligible_accounts(request).await?;

        loop {
            let ids: Vec<AccountId> = candidates.iter().map(|a| a.id).collect();
            let picked = self
                .balancer
                .lock()
                .await
                .select(&ids, request.operation, request.strategy);
            let Some(index) = picked else {
                process_warn!(ProcessRole::current(), "🚫 No accounts available for {}", request.operation);
                return Err(GatewayError::NoAccountsAvailable {
                    operation: request.operation.to_string(),
                });
            };

            let account = candidates.remove(index);
            if self.token_gate(&account).await {
                self.balancer.lock().await.record_usage(account.id);
                process_debug!(
                    ProcessRole::current(),
                    "🧭 {} routed to {} ({})",
                    request.operation,
                    account.name,
                    request.strategy
                );
                return Ok(account);
            }
        }
    }

    pub async fn get_default_trading_account(&self) -> GatewayResult<Option<Account>> {
        self.default_account(DefaultRole::Trading).await
    }

    pub async fn get_default_data_account(&self) -> GatewayResult<Option<Account>> {
        self.default_account(DefaultRole::Data).await
    }

    /// Trading routes prefer the default trading account, then least-used
    pub async fn route_trading_operation(
        &self,
        operation: OperationType,
        required_permissions: Vec<MarketPermission>,
        environment: Option<BrokerEnvironment>,
    ) -> GatewayResult<Account> {
        if !operation.is_trading() {
            return Err(GatewayError::OperationNotSupported {
                operation: operation.to_string(),
            });
        }
        let mut request = RouteRequest::new(operation)
            .with_permissions(required_permissions)
            .with_strategy(RoutingStrategy::LeastUsed);
        request.environment = environment;
        self.route_with_default(DefaultRole::Trading, request).await
    }

    /// Data routes prefer the default data account, then round-robin
    pub async fn route_data_operation(
        &self,
        operation: OperationType,
        required_permissions: Vec<MarketPermission>,
        environment: Option<BrokerEnvironment>,
    ) -> GatewayResult<Account> {
        if !operation.is_data() {
            return Err(GatewayError::OperationNotSupported {
                operation: operation.to_string(),
            });
        }
        let mut request = RouteRequest::new(operation)
            .with_permissions(required_permissions)
            .with_strategy(RoutingStrategy::RoundRobin);
        request.environment = environment;
        self.route_with_default(DefaultRole::Data, request).await
    }

    pub async fn record_operation_response_time(&self, account_id: AccountId, latency_ms: f64) {
        self.balancer.lock().await.record_latency(account_id, latency_ms);
    }

    /// Local view only; does not refresh tokens
    pub async fn check_account_availability(&self, account_id: AccountId) -> GatewayResult<AccountAvailability> {
        let account = self
            .store
            .get_account(account_id)
            .await?
            .ok_or(GatewayError::AccountNotFound { account_id })?;

        let token_valid = account.has_valid_token(Utc::now());
        let mut reasons = Vec::new();
        if account.status != AccountStatus::Active {
            reasons.push(format!("account is {}", account.status));
        }
        if account.error_count >= self.config.data_error_threshold {
            reasons.push(format!("error count {} over the data threshold", account.error_count));
        } else if account.error_count >= self.config.trading_error_threshold {
            reasons.push(format!("error count {} over the trading threshold", account.error_count));
        }
        if !token_valid {
            reasons.push("no valid access token".to_string());
        }

        let balancer = self.balancer.lock().await;
        Ok(AccountAvailability {
            account_id,
            available: account.is_active() && account.error_count < self.config.data_error_threshold,
            reasons,
            error_count: account.error_count,
            token_valid,
            usage_count: balancer.usage_count(&account_id),
            average_latency_ms: balancer.average_latency(&account_id),
        })
    }

    pub async fn get_routing_statistics(&self) -> RoutingStatistics {
        let balancer = self.balancer.lock().await;
        let usage_distribution = balancer.usage_distribution();
        RoutingStatistics {
            total_routed: usage_distribution.values().sum(),
            usage_distribution,
            average_latencies: balancer.average_latencies(),
        }
    }

    /// Eligible candidates without the token gate
    pub async fn get_available_accounts_for_operation(
        &self,
        operation: OperationType,
        required_permissions: Vec<MarketPermission>,
        environment: Option<BrokerEnvironment>,
    ) -> GatewayResult<Vec<Account>> {
        let mut request = RouteRequest::new(operation).with_permissions(required_permissions);
        request.environment = environment;
        self.eligible_accounts(&request).await
    }

    async fn route_with_default(&self, role: DefaultRole, mut request: RouteRequest) -> GatewayResult<Account> {
        if let Some(account) = self.default_account(role).await? {
            if self.is_eligible(&account, &request) {
                if self.token_gate(&account).await {
                    self.balancer.lock().await.record_usage(account.id);
                    process_debug!(
                        ProcessRole::current(),
                        "🧭 {} routed to default account {}",
                        request.operation,
                        account.name
                    );
                    return Ok(account);
                }
                request.exclude.insert(account.id);
            }
        }
        self.route_operation(&request).await
    }

    async fn default_account(&self, role: DefaultRole) -> GatewayResult<Option<Account>> {
        Ok(self.store.get_default_account(role).await?.filter(Account::is_active))
    }

    async fn eligible_accounts(&self, request: &RouteRequest) -> GatewayResult<Vec<Account>> {
        let filter = AccountFilter {
            environment: request.environment,
            account_type: request.account_type,
            ..AccountFilter::active()
        };
        let accounts = self.store.list_accounts(filter).await?;
        Ok(accounts.into_iter().filter(|a| self.is_eligible(a, request)).collect())
    }

    fn is_eligible(&self, account: &Account, request: &RouteRequest) -> bool {
        let threshold = if request.operation.is_trading() {
            self.config.trading_error_threshold
        } else {
            self.config.data_error_threshold
        };

        account.is_active()
            && request.environment.map_or(true, |e| account.environment == e)
            && request.account_type.map_or(true, |t| account.account_type == t)
            && account.has_permissions(&request.required_permissions)
            && (!request.operation.is_trading() || account.supports_trading())
            && account.error_count < threshold
            && !request.exclude.contains(&account.id)
    }

    async fn token_gate(&self, account: &Account) -> bool {
        match self.validator.ensure_valid_token(account).await {
            Ok(true) => true,
            Ok(false) => {
                process_info!(ProcessRole::current(), "🔒 Skipping {}: token unavailable", account.name);
                false
            }
            Err(e) => {
                process_warn!(ProcessRole::current(), "🔒 Skipping {}: token check failed: {}", account.name, e);
                false
            }
        }
    }
}
