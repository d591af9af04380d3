//! Tests for HttpBrokerSession

use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::common::credentials;
use crate::error::WorkerError;
use crate::services::HttpBrokerSession;
use crate::traits::BrokerSession;

async fn open_session(server: &MockServer) -> HttpBrokerSession {
    let session = HttpBrokerSession::new(credentials(&server.uri()), Duration::from_secs(2)).unwrap();
    session.open().await.unwrap();
    session
}

/// Calls before open are refused without touching the network
#[tokio::test]
async fn test_call_before_open_is_rejected() {
    let server = MockServer::start().await;
    let session = HttpBrokerSession::new(credentials(&server.uri()), Duration::from_secs(2)).unwrap();

    let err = session.call("get_account", json!({})).await.unwrap_err();

    assert!(matches!(err, WorkerError::NotInitialized));
    assert!(server.received_requests().await.unwrap_or_default().is_empty());
}

/// Open fails when the private key is blank
#[tokio::test]
async fn test_open_requires_private_key() {
    let mut creds = credentials("https://broker.example.test");
    creds.private_key = "  ".to_string();
    let session = HttpBrokerSession::new(creds, Duration::from_secs(2)).unwrap();

    let err = session.open().await.unwrap_err();
    assert!(matches!(err, WorkerError::SessionError { .. }));
}

/// Invalid server URLs are caught at construction
#[test]
fn test_invalid_server_url() {
    let result = HttpBrokerSession::new(credentials("not a url"), Duration::from_secs(2));
    assert!(matches!(result, Err(WorkerError::ConfigError { .. })));
}

/// Successful calls unwrap the `data` envelope and send the bearer token
#[tokio::test]
async fn test_call_returns_data_payload() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/gateway"))
        .and(header("authorization", "Bearer access-7"))
        .and(body_partial_json(json!({"method": "get_positions", "account": "U7654321"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 0,
            "data": [{"symbol": "AAPL", "quantity": 10}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let session = open_session(&server).await;
    let result = session.call("get_positions", json!({"symbol": null})).await.unwrap();

    assert_eq!(result[0]["symbol"], "AAPL");
}

/// Non-zero application codes become broker errors
#[tokio::test]
async fn test_application_error_code() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/gateway"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 1010,
            "message": "insufficient buying power"
        })))
        .mount(&server)
        .await;

    let session = open_session(&server).await;
    let err = session.call("place_order", json!({})).await.unwrap_err();

    match err {
        WorkerError::BrokerError { operation, message, .. } => {
            assert_eq!(operation, "place_order");
            assert!(message.contains("insufficient buying power"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

/// HTTP failures carry the status code
#[tokio::test]
async fn test_http_error_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&server)
        .await;

    let session = open_session(&server).await;
    let err = session.call("get_account", json!({})).await.unwrap_err();

    assert!(matches!(err, WorkerError::BrokerError { status: 503, .. }));
}
