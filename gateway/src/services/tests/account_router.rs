//! Tests for the account router

use std::sync::Arc;

use shared::AccountId;

use super::common::{production_account, sandbox_account};
use crate::core::balancer::RoutingStrategy;
use crate::error::GatewayError;
use crate::services::account_router::{AccountRouter, RouteRequest};
use crate::services::memory_store::InMemoryStore;
use crate::traits::MockTokenValidator;
use crate::types::{Account, AccountType, MarketPermission, OperationType};

fn accepting_validator() -> MockTokenValidator {
    let mut validator = MockTokenValidator::new();
    validator.expect_ensure_valid_token().returning(|_| Ok(true));
    validator
}

fn router(accounts: Vec<Account>, validator: MockTokenValidator) -> AccountRouter {
    AccountRouter::new(Arc::new(InMemoryStore::from_accounts(accounts)), Arc::new(validator))
}

fn names(accounts: &[Account]) -> Vec<&str> {
    accounts.iter().map(|a| a.name.as_str()).collect()
}

/// Least-used spreads work evenly
#[tokio::test]
async fn test_least_used_balances_usage() {
    let router = router(vec![production_account("a"), production_account("b")], accepting_validator());
    let request = RouteRequest::new(OperationType::Positions).with_strategy(RoutingStrategy::LeastUsed);

    let mut picked = Vec::new();
    for _ in 0..4 {
        picked.push(router.route_operation(&request).await.unwrap().name);
    }

    assert_eq!(picked, vec!["a", "b", "a", "b"]);
    let stats = router.get_routing_statistics().await;
    assert_eq!(stats.total_routed, 4);
    assert!(stats.usage_distribution.values().all(|count| *count == 2));
}

/// Round-robin rotates through candidates in order
#[tokio::test]
async fn test_round_robin_rotates() {
    let router = router(
        vec![production_account("a"), production_account("b"), production_account("c")],
        accepting_validator(),
    );
    let request = RouteRequest::new(OperationType::Quote).with_strategy(RoutingStrategy::RoundRobin);

    let mut picked = Vec::new();
    for _ in 0..4 {
        picked.push(router.route_operation(&request).await.unwrap().name);
    }

    assert_eq!(picked, vec!["a", "b", "c", "a"]);
}

/// Fastest-response prefers measured accounts and tries unmeasured ones last
#[tokio::test]
async fn test_fastest_response() {
    let slow = production_account("slow");
    let fast = production_account("fast");
    let (slow_id, fast_id) = (slow.id, fast.id);
    let router = router(vec![production_account("unmeasured"), slow, fast], accepting_validator());
    router.record_operation_response_time(slow_id, 250.0).await;
    router.record_operation_response_time(fast_id, 40.0).await;
    router.record_operation_response_time(fast_id, 60.0).await;

    let request = RouteRequest::new(OperationType::MarketData).with_strategy(RoutingStrategy::FastestResponse);
    let chosen = router.route_operation(&request).await.unwrap();

    assert_eq!(chosen.name, "fast");
    let stats = router.get_routing_statistics().await;
    assert_eq!(stats.average_latencies.get(&fast_id), Some(&50.0));
}

/// Trading needs production or paper accounts
#[tokio::test]
async fn test_trading_eligibility() {
    let router = router(
        vec![
            sandbox_account("sandbox-standard", AccountType::Standard),
            sandbox_account("sandbox-paper", AccountType::Paper),
        ],
        accepting_validator(),
    );

    let trading = router
        .get_available_accounts_for_operation(OperationType::PlaceOrder, Vec::new(), None)
        .await
        .unwrap();
    let data = router
        .get_available_accounts_for_operation(OperationType::Quote, Vec::new(), None)
        .await
        .unwrap();

    assert_eq!(names(&trading), vec!["sandbox-paper"]);
    assert_eq!(data.len(), 2);
}

/// Error thresholds differ between trading and data operations
#[tokio::test]
async fn test_error_thresholds() {
    let mut shaky = production_account("shaky");
    shaky.error_count = 5;
    let mut broken = production_account("broken");
    broken.error_count = 10;
    let router = router(vec![production_account("clean"), shaky, broken], accepting_validator());

    let trading = router
        .get_available_accounts_for_operation(OperationType::CancelOrder, Vec::new(), None)
        .await
        .unwrap();
    let data = router
        .get_available_accounts_for_operation(OperationType::HistoricalData, Vec::new(), None)
        .await
        .unwrap();

    assert_eq!(names(&trading), vec!["clean"]);
    assert_eq!(names(&data), vec!["clean", "shaky"]);
}

/// Required permissions, environment and exclusions narrow the candidates
#[tokio::test]
async fn test_filters_and_exclusions() {
    let mut hk = production_account("hk");
    hk.market_permissions.push(MarketPermission::HkStock);
    let us = production_account("us");
    let us_id = us.id;
    let router = router(vec![us, hk, sandbox_account("sandbox", AccountType::Paper)], accepting_validator());

    let hk_only = RouteRequest::new(OperationType::Quote).with_permissions([MarketPermission::HkStock]);
    assert_eq!(router.route_operation(&hk_only).await.unwrap().name, "hk");

    let sandbox_only =
        RouteRequest::new(OperationType::Quote).with_environment(shared::BrokerEnvironment::Sandbox);
    assert_eq!(router.route_operation(&sandbox_only).await.unwrap().name, "sandbox");

    let paper_only = RouteRequest::new(OperationType::Quote).with_account_type(AccountType::Paper);
    assert_eq!(router.route_operation(&paper_only).await.unwrap().name, "sandbox");

    let production = RouteRequest::new(OperationType::Quote)
        .with_environment(shared::BrokerEnvironment::Production)
        .excluding([us_id]);
    assert_eq!(router.route_operation(&production).await.unwrap().name, "hk");
}

/// Accounts failing the token gate are skipped
#[tokio::test]
async fn test_token_gate_skips_candidates() {
    let mut validator = MockTokenValidator::new();
    validator
        .expect_ensure_valid_token()
        .returning(|account| Ok(account.name != "expired"));
    let router = router(vec![production_account("expired"), production_account("fresh")], validator);

    for _ in 0..3 {
        let chosen = router
            .route_operation(&RouteRequest::new(OperationType::Orders))
            .await
            .unwrap();
        assert_eq!(chosen.name, "fresh");
    }
}

/// Validator errors count as unusable tokens
#[tokio::test]
async fn test_token_gate_errors_skip_candidates() {
    let mut validator = MockTokenValidator::new();
    validator.expect_ensure_valid_token().returning(|account| {
        if account.name == "flaky" {
            Err(GatewayError::TokenRefresh {
                status: Some(500),
                message: "boom".to_string(),
            })
        } else {
            Ok(true)
        }
    });
    let router = router(vec![production_account("flaky"), production_account("steady")], validator);

    let chosen = router
        .route_operation(&RouteRequest::new(OperationType::AccountInfo))
        .await
        .unwrap();

    assert_eq!(chosen.name, "steady");
}

/// Exhausting every candidate is a typed error
#[tokio::test]
async fn test_no_accounts_available() {
    let mut validator = MockTokenValidator::new();
    validator.expect_ensure_valid_token().times(2).returning(|_| Ok(false));
    let router = router(vec![production_account("a"), production_account("b")], validator);

    let err = router
        .route_operation(&RouteRequest::new(OperationType::Quote))
        .await
        .unwrap_err();

    assert!(matches!(err, GatewayError::NoAccountsAvailable { .. }));
}

/// Empty stores fail without consulting the validator
#[tokio::test]
async fn test_no_accounts_configured() {
    let mut validator = MockTokenValidator::new();
    validator.expect_ensure_valid_token().never();
    let router = router(Vec::new(), validator);

    let err = router
        .route_data_operation(OperationType::Quote, Vec::new(), None)
        .await
        .unwrap_err();

    assert!(matches!(err, GatewayError::NoAccountsAvailable { .. }));
}

/// Typed routes reject operations of the other class
#[tokio::test]
async fn test_typed_routes_reject_wrong_operations() {
    let router = router(vec![production_account("a")], accepting_validator());

    let trading = router
        .route_trading_operation(OperationType::Quote, Vec::new(), None)
        .await
        .unwrap_err();
    let data = router
        .route_data_operation(OperationType::PlaceOrder, Vec::new(), None)
        .await
        .unwrap_err();

    assert!(matches!(trading, GatewayError::OperationNotSupported { .. }));
    assert!(matches!(data, GatewayError::OperationNotSupported { .. }));
}

/// The default trading account wins while it is eligible
#[tokio::test]
async fn test_default_trading_account_shortcut() {
    let other = production_account("other");
    let mut default = production_account("default");
    default.is_default_trading = true;
    let router = router(vec![other, default], accepting_validator());

    for _ in 0..3 {
        let chosen = router
            .route_trading_operation(OperationType::PlaceOrder, Vec::new(), None)
            .await
            .unwrap();
        assert_eq!(chosen.name, "default");
    }
    assert_eq!(router.get_default_trading_account().await.unwrap().unwrap().name, "default");
    assert!(router.get_default_data_account().await.unwrap().is_none());
}

/// A default account without a usable token falls back to the rest
#[tokio::test]
async fn test_default_account_falls_back() {
    let mut default = production_account("default");
    default.is_default_data = true;
    let mut validator = MockTokenValidator::new();
    validator
        .expect_ensure_valid_token()
        .withf(|account| account.name == "default")
        .times(1)
        .returning(|_| Ok(false));
    validator
        .expect_ensure_valid_token()
        .withf(|account| account.name != "default")
        .returning(|_| Ok(true));
    let router = router(vec![default, production_account("backup")], validator);

    let chosen = router
        .route_data_operation(OperationType::Quote, Vec::new(), None)
        .await
        .unwrap();

    assert_eq!(chosen.name, "backup");
}

/// A default account lacking required permissions is bypassed
#[tokio::test]
async fn test_default_account_must_be_eligible() {
    let mut default = production_account("default");
    default.is_default_trading = true;
    let mut futures = production_account("futures");
    futures.market_permissions.push(MarketPermission::Futures);
    let router = router(vec![default, futures], accepting_validator());

    let chosen = router
        .route_trading_operation(OperationType::PlaceOrder, vec![MarketPermission::Futures], None)
        .await
        .unwrap();

    assert_eq!(chosen.name, "futures");
}

/// Availability reports reasons without refreshing anything
#[tokio::test]
async fn test_check_account_availability() {
    let mut tired = production_account("tired");
    tired.error_count = 6;
    tired.token_expires_at = None;
    let tired_id = tired.id;
    let mut validator = MockTokenValidator::new();
    validator.expect_ensure_valid_token().never();
    let router = router(vec![tired], validator);

    let report = router.check_account_availability(tired_id).await.unwrap();

    assert!(report.available);
    assert!(!report.token_valid);
    assert_eq!(report.reasons.len(), 2);
    assert_eq!(report.usage_count, 0);

    let missing = router.check_account_availability(AccountId::new()).await.unwrap_err();
    assert!(matches!(missing, GatewayError::AccountNotFound { .. }));
}
